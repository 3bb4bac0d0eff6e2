use crate::error::Error;
use crate::snapshot::Snapshot;
use crate::visits::{require_codes, VisitQuery, VisitSource};
use crate::whois::WhoIs;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use log::info;
use std::path::Path;

/// Days fetched when a snapshot is created from scratch
const INITIAL_DAYS: i64 = 30;

/// Parameters of one `update` run
#[derive(Debug, Clone)]
pub struct UpdateRequest<'a> {
    pub db_path: &'a Path,
    pub site_id: &'a str,
    pub codes: &'a [String],
    pub max_pages: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The watermark already covers yesterday; nothing was fetched or written
    UpToDate { last_update: DateTime<Utc> },
    Updated {
        created: bool,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        visits: usize,
        sources: usize,
    },
}

fn start_of_day(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Last second of the day before `now` (UTC); today is never processed.
pub fn window_end(now: DateTime<Utc>) -> DateTime<Utc> {
    start_of_day(now) - Duration::seconds(1)
}

/// Start of the first window for a new snapshot: the whole day `INITIAL_DAYS` before `end`.
pub fn initial_start(end: DateTime<Utc>) -> DateTime<Utc> {
    start_of_day(end - Duration::days(INITIAL_DAYS))
}

/// Bring the snapshot at `req.db_path` up to the end of yesterday.
///
/// A missing file is created. Nothing is written unless every fetched visit
/// folds successfully, in which case the watermark moves to the window end.
pub fn run_update(
    req: &UpdateRequest<'_>,
    now: DateTime<Utc>,
    source: &dyn VisitSource,
    whois: &dyn WhoIs,
) -> Result<UpdateOutcome, Error> {
    let codes = require_codes(req.codes)?;

    let end = window_end(now);

    let (mut snapshot, start, created) = match Snapshot::load(req.db_path, req.site_id) {
        Ok(snapshot) => {
            info!("loading {}", req.db_path.display());
            if end <= snapshot.last_update {
                return Ok(UpdateOutcome::UpToDate {
                    last_update: snapshot.last_update,
                });
            }
            let start = snapshot.last_update + Duration::seconds(1);
            (snapshot, start, false)
        }
        Err(Error::NotFound { .. }) => {
            info!("creating {}", req.db_path.display());
            let mut snapshot = Snapshot::new(req.site_id);
            snapshot.set_db_path(req.db_path);
            (snapshot, initial_start(end), true)
        }
        Err(e) => return Err(e),
    };

    let from = start.format("%Y-%m-%d").to_string();
    let to = end.format("%Y-%m-%d").to_string();
    if from == to {
        info!("updating - loading events from {}", from);
    } else {
        info!("updating - loading events from {} to {}", from, to);
    }

    let query = VisitQuery {
        site_id: req.site_id.to_string(),
        start,
        end,
        max_pages: req.max_pages,
        codes,
    };
    let batch = source.get_visits(&query)?;

    for visit in &batch.visits {
        snapshot.add_visit(visit, whois)?;
    }

    snapshot.last_update = end;
    info!("saving changes to {}", req.db_path.display());
    snapshot.save()?;

    Ok(UpdateOutcome::Updated {
        created,
        start,
        end,
        visits: batch.visits.len(),
        sources: snapshot.data.len(),
    })
}
