//! Table shown by `cl-tunnel list`

use cltunnel_ingress::IngressDocument;

use crate::identity::IdentityDocument;

const HEADERS: [&str; 3] = ["NAME", "URL", "SERVICE"];

/// One row per hostname rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRow {
    pub name: String,
    pub url: String,
    pub service: String,
}

pub fn rows(identity: &IdentityDocument, document: &IngressDocument) -> Vec<ListingRow> {
    document
        .hostname_rules()
        .filter_map(|rule| {
            let hostname = rule.hostname.as_deref()?;
            Some(ListingRow {
                name: identity.subdomain_of(hostname).to_string(),
                url: format!("https://{}", hostname),
                service: rule.service.to_string(),
            })
        })
        .collect()
}

/// Render rows as a left-aligned table with a header line
pub fn render(rows: &[ListingRow]) -> String {
    let mut widths = HEADERS.map(str::len);
    for row in rows {
        widths[0] = widths[0].max(row.name.len());
        widths[1] = widths[1].max(row.url.len());
        widths[2] = widths[2].max(row.service.len());
    }

    let line = |cells: [&str; 3]| {
        format!(
            "{:<w0$}  {:<w1$}  {}",
            cells[0],
            cells[1],
            cells[2],
            w0 = widths[0],
            w1 = widths[1]
        )
        .trim_end()
        .to_string()
    };

    let mut out = vec![line(HEADERS)];
    out.extend(
        rows.iter()
            .map(|r| line([r.name.as_str(), r.url.as_str(), r.service.as_str()])),
    );
    out.join("\n")
}
