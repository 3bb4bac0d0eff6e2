use crate::snapshot::{EntryPage, RequestSource, Snapshot};
use colored::Colorize;
use std::collections::BTreeMap;
use std::io::{self, Write};

/// WHOIS fields shown in reports, in display order
pub const KNOWN_FIELDS: [&str; 9] = [
    "OrgName",
    "OrgTechName",
    "OrgTechPhone",
    "OrgTechEmail",
    "Address",
    "City",
    "StateProv",
    "PostalCode",
    "Country",
];

pub const CSV_HEADING: &str = "site,ip,url,hits,from,to,org-name,org-tech-name,org-tech-phone,org-tech-email,address,city,state,postal-code,country";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Write the human-readable listing of every source in `snapshot`.
///
/// Dates are UTC. `hits` is the per-IP total, repeated on each page line.
pub fn write_human<W: Write>(out: &mut W, snapshot: &Snapshot, color: bool) -> io::Result<()> {
    if !snapshot.site_id.is_empty() {
        writeln!(out, "Site: {}\n", snapshot.site_id)?;
    }

    for (ip, source) in &snapshot.data {
        let label = if color {
            ip.cyan().bold().to_string()
        } else {
            ip.clone()
        };

        if let [page] = source.pages.as_slice() {
            writeln!(out, "{}: {}", label, page_line(page, source.hits))?;
        } else {
            writeln!(out, "{}:", label)?;
            writeln!(out, "  Pages:")?;
            for page in &source.pages {
                writeln!(out, "  {}", page_line(page, source.hits))?;
            }
        }

        write_info(out, source)?;
        writeln!(out)?;
    }
    Ok(())
}

/// The `view` command: the listing followed by the watermark date.
pub fn write_view<W: Write>(out: &mut W, snapshot: &Snapshot, color: bool) -> io::Result<()> {
    write_human(out, snapshot, color)?;
    writeln!(
        out,
        "Last update: {}\n",
        snapshot.last_update.format(DATE_FORMAT)
    )
}

fn page_line(page: &EntryPage, hits: u64) -> String {
    let from = page.first_access.format(DATE_FORMAT).to_string();
    let to = page.last_access.format(DATE_FORMAT).to_string();
    if from == to {
        format!("{} - {} hits {}", page.url, hits, from)
    } else {
        format!("{} - {} hits {} to {}", page.url, hits, from, to)
    }
}

fn write_info<W: Write>(out: &mut W, source: &RequestSource) -> io::Result<()> {
    for field in KNOWN_FIELDS {
        if let Some(value) = source.info.get(field) {
            writeln!(out, "  {}: {}", field, value)?;
        }
    }
    Ok(())
}

/// Quote a CSV cell only when it contains `"` or `,`.
pub fn escape_csv_cell(text: &str) -> String {
    if text.contains(['"', ',']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

/// Write one CSV row per (IP, page), optionally preceded by the heading row.
pub fn write_csv<W: Write>(out: &mut W, snapshot: &Snapshot, heading: bool) -> io::Result<()> {
    if heading {
        writeln!(out, "{}", CSV_HEADING)?;
    }

    let site = escape_csv_cell(&snapshot.site_id);
    for (ip, source) in &snapshot.data {
        let info: Vec<String> = KNOWN_FIELDS
            .iter()
            .map(|f| escape_csv_cell(source.info.get(*f).map(String::as_str).unwrap_or("")))
            .collect();

        for page in &source.pages {
            writeln!(
                out,
                "{},{},{},{},{},{},{}",
                site,
                escape_csv_cell(ip),
                escape_csv_cell(&page.url),
                source.hits,
                page.first_access.format(DATE_FORMAT),
                page.last_access.format(DATE_FORMAT),
                info.join(",")
            )?;
        }
    }
    Ok(())
}

/// The `codes` command: hit count per rule code, then a total line.
pub fn write_codes<W: Write>(out: &mut W, codes: &BTreeMap<String, u64>) -> io::Result<()> {
    writeln!(out)?;
    if !codes.is_empty() {
        for (code, count) in codes {
            let noun = if *count == 1 { "hit" } else { "hits" };
            writeln!(out, "{}: {} {}", code, count, noun)?;
        }
        writeln!(out)?;
    }

    if codes.len() == 1 {
        writeln!(out, "1 code found")
    } else {
        writeln!(out, "{} codes found", codes.len())
    }
}
