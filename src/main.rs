mod aggregator;
mod error;
mod imperva;
mod report;
mod snapshot;
mod update;
mod visits;
mod whois;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use error::Error;
use imperva::ImpervaClient;
use snapshot::Snapshot;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use update::{UpdateOutcome, UpdateRequest};
use visits::{VisitQuery, VisitSource};
use whois::WhoisClient;

/// Aggregates WAF visit sources per site, enriched with WHOIS ownership data
#[derive(Parser, Debug)]
#[command(
    name = "waf_sources",
    author,
    version,
    about = "Aggregates WAF visit sources per site, enriched with WHOIS ownership data",
    after_help = "You must provide IMPERVA_API_KEY and IMPERVA_API_ID environment variables."
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Query from the specified start date (YYYY-MM-DD) or date range and print the sources
    Scan {
        #[arg(value_name = "START_DATE")]
        start: String,
        #[arg(value_name = "END_DATE")]
        end: Option<String>,
        /// The site ID (see the Websites list in the vendor console)
        #[arg(long = "site", value_name = "SITE_ID")]
        site: String,
        /// A rule code or code prefix; repeat for more than one
        #[arg(long = "code", value_name = "CODE")]
        codes: Vec<String>,
        /// Limit the number of pages of events (default 10)
        #[arg(long = "max-pages", value_name = "N", allow_negative_numbers = true)]
        max_pages: Option<i64>,
    },

    /// List rule codes encountered from the specified start date or date range
    Codes {
        #[arg(value_name = "START_DATE")]
        start: String,
        #[arg(value_name = "END_DATE")]
        end: Option<String>,
        #[arg(long = "site", value_name = "SITE_ID")]
        site: String,
        /// Limit the number of pages of events (default 10)
        #[arg(long = "max-pages", value_name = "N", allow_negative_numbers = true)]
        max_pages: Option<i64>,
    },

    /// Maintain aggregation state in a file; partial days are never processed
    Update {
        #[arg(value_name = "DB_PATH")]
        db_path: PathBuf,
        #[arg(long = "site", value_name = "SITE_ID")]
        site: String,
        /// A rule code or code prefix; repeat for more than one
        #[arg(long = "code", value_name = "CODE")]
        codes: Vec<String>,
        /// Limit the number of pages of events (default 1000)
        #[arg(long = "max-pages", value_name = "N", allow_negative_numbers = true)]
        max_pages: Option<i64>,
    },

    /// Print the aggregation in a database file in human-readable format
    View {
        #[arg(value_name = "DB_PATH")]
        db_path: PathBuf,
    },

    /// Print the aggregation in a database file as CSV
    Csv {
        #[arg(value_name = "DB_PATH")]
        db_path: PathBuf,
        /// Omit the heading row
        #[arg(long = "no-heading")]
        no_heading: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(command: Command) -> Result<(), Error> {
    match command {
        Command::Scan {
            start,
            end,
            site,
            codes,
            max_pages,
        } => scan(&start, end.as_deref(), &site, codes, max_pages),
        Command::Codes {
            start,
            end,
            site,
            max_pages,
        } => list_codes(&start, end.as_deref(), &site, max_pages),
        Command::Update {
            db_path,
            site,
            codes,
            max_pages,
        } => run_update(&db_path, &site, &codes, max_pages),
        Command::View { db_path } => {
            let snapshot = Snapshot::load(&db_path, "")?;
            let color = io::stdout().is_terminal();
            emit(&db_path, |out| report::write_view(out, &snapshot, color))
        }
        Command::Csv {
            db_path,
            no_heading,
        } => {
            let snapshot = Snapshot::load(&db_path, "")?;
            emit(&db_path, |out| report::write_csv(out, &snapshot, !no_heading))
        }
    }
}

fn scan(
    start: &str,
    end: Option<&str>,
    site: &str,
    codes: Vec<String>,
    max_pages: Option<i64>,
) -> Result<(), Error> {
    let (start, end) = date_range(start, end)?;
    let codes = visits::require_codes(&codes)?;

    let query = VisitQuery {
        site_id: site.to_string(),
        start,
        end,
        max_pages: visits::max_pages_or(max_pages, visits::DEFAULT_SCAN_MAX_PAGES),
        codes,
    };
    println!("Getting visits");
    let batch = ImpervaClient::from_env()?.get_visits(&query)?;

    let whois = WhoisClient::from_env();
    let mut snapshot = Snapshot::new(site);
    for visit in &batch.visits {
        snapshot.add_visit(visit, &whois)?;
    }

    let color = io::stdout().is_terminal();
    emit(Path::new("<stdout>"), |out| {
        report::write_human(out, &snapshot, color)
    })
}

fn list_codes(
    start: &str,
    end: Option<&str>,
    site: &str,
    max_pages: Option<i64>,
) -> Result<(), Error> {
    let (start, end) = date_range(start, end)?;
    let query = VisitQuery {
        site_id: site.to_string(),
        start,
        end,
        max_pages: visits::max_pages_or(max_pages, visits::DEFAULT_SCAN_MAX_PAGES),
        codes: Vec::new(),
    };
    println!("Getting visits");
    let batch = ImpervaClient::from_env()?.get_visits(&query)?;
    emit(Path::new("<stdout>"), |out| report::write_codes(out, &batch.codes))
}

fn run_update(
    db_path: &Path,
    site: &str,
    codes: &[String],
    max_pages: Option<i64>,
) -> Result<(), Error> {
    let codes = visits::require_codes(codes)?;
    let source = ImpervaClient::from_env()?;
    let whois = WhoisClient::from_env();
    let req = UpdateRequest {
        db_path,
        site_id: site,
        codes: &codes,
        max_pages: visits::max_pages_or(max_pages, visits::DEFAULT_UPDATE_MAX_PAGES),
    };

    match update::run_update(&req, Utc::now(), &source, &whois)? {
        UpdateOutcome::UpToDate { last_update } => {
            println!(
                "Database is up to date (last update {}).",
                last_update.format("%Y-%m-%d")
            );
        }
        UpdateOutcome::Updated {
            created,
            start,
            end,
            visits,
            sources,
        } => {
            println!(
                "Update complete{}: {} visits from {} to {}, {} sources",
                if created { " (created)" } else { "" },
                visits,
                start.format("%Y-%m-%d"),
                end.format("%Y-%m-%d"),
                sources
            );
        }
    }
    Ok(())
}

/// Parse `YYYY-MM-DD` as midnight UTC.
fn parse_date(which: &'static str, value: &str) -> Result<DateTime<Utc>, Error> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
        .map_err(|_| Error::InvalidDate {
            which,
            value: value.to_string(),
        })
}

/// A start date plus an optional end date that defaults to now.
fn date_range(start: &str, end: Option<&str>) -> Result<(DateTime<Utc>, DateTime<Utc>), Error> {
    let start = parse_date("start", start)?;
    let end = match end {
        Some(end) => parse_date("end", end)?,
        None => Utc::now(),
    };
    Ok((start, end))
}

/// Run a renderer against locked stdout, mapping write failures to `Error::Io`.
fn emit<F>(label: &Path, render: F) -> Result<(), Error>
where
    F: FnOnce(&mut io::StdoutLock<'static>) -> io::Result<()>,
{
    let mut out = io::stdout().lock();
    render(&mut out)
        .and_then(|_| out.flush())
        .map_err(|e| Error::io(label, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_dates_as_utc_midnight() {
        assert_eq!(
            parse_date("start", "2024-03-15").unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn rejects_bad_dates_naming_the_value() {
        for bad in ["2024-13-01", "15/03/2024", "", "2024-02-30"] {
            match parse_date("end", bad) {
                Err(Error::InvalidDate { which, value }) => {
                    assert_eq!(which, "end");
                    assert_eq!(value, bad);
                }
                other => panic!("expected InvalidDate for {:?}, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn explicit_date_range() {
        let (start, end) = date_range("2024-03-01", Some("2024-03-05")).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap());
    }

    #[test]
    fn open_range_ends_now() {
        let before = Utc::now();
        let (_, end) = date_range("2024-03-01", None).unwrap();
        assert!(end >= before);
    }

    #[test]
    fn cli_accepts_repeated_codes() {
        let args = Args::try_parse_from([
            "waf_sources",
            "update",
            "s.db",
            "--site",
            "A",
            "--code",
            "R1",
            "--code",
            "R2",
            "--max-pages",
            "0",
        ])
        .unwrap();
        match args.command {
            Command::Update {
                db_path,
                site,
                codes,
                max_pages,
            } => {
                assert_eq!(db_path, PathBuf::from("s.db"));
                assert_eq!(site, "A");
                assert_eq!(codes, vec!["R1", "R2"]);
                assert_eq!(max_pages, Some(0));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn cli_requires_site_for_scan() {
        assert!(Args::try_parse_from(["waf_sources", "scan", "2024-03-01", "--code", "R1"]).is_err());
    }

    #[test]
    fn cli_csv_no_heading_flag() {
        let args = Args::try_parse_from(["waf_sources", "csv", "s.db", "--no-heading"]).unwrap();
        assert!(matches!(args.command, Command::Csv { no_heading: true, .. }));
    }
}
