use crate::error::Error;
use crate::snapshot::{EntryPage, RequestSource, Snapshot};
use crate::visits::Visit;
use crate::whois::WhoIs;
use chrono::{DateTime, Utc};
use log::debug;

impl Snapshot {
    /// Fold one visit into the snapshot.
    ///
    /// Each client IP is handled in order, so an IP listed twice counts twice.
    /// An IP seen for the first time is enriched through `whois` before it is
    /// inserted; a failed lookup aborts without leaving a partial record.
    pub fn add_visit(&mut self, visit: &Visit, whois: &dyn WhoIs) -> Result<(), Error> {
        let access = DateTime::<Utc>::from_timestamp_millis(visit.start_time).ok_or_else(|| {
            Error::Upstream(format!(
                "visit start time {} is out of range",
                visit.start_time
            ))
        })?;

        for ip in &visit.client_ips {
            if !self.data.contains_key(ip) {
                let info = whois.who_is(ip).map_err(|source| Error::WhoIs {
                    ip: ip.clone(),
                    source,
                })?;
                debug!("new source {} ({} whois fields)", ip, info.len());
                self.data.insert(
                    ip.clone(),
                    RequestSource {
                        ip: ip.clone(),
                        info,
                        pages: Vec::new(),
                        hits: 0,
                    },
                );
            }

            let Some(source) = self.data.get_mut(ip) else {
                continue;
            };
            source.record(&visit.entry_page, access);
        }
        Ok(())
    }
}

impl RequestSource {
    /// Count one hit on `url` at `access`, widening that page's window.
    fn record(&mut self, url: &str, access: DateTime<Utc>) {
        self.hits += 1;

        match self.pages.iter_mut().find(|p| p.url == url) {
            Some(page) => {
                if access < page.first_access {
                    page.first_access = access;
                }
                if access > page.last_access {
                    page.last_access = access;
                }
            }
            None => self.pages.push(EntryPage {
                url: url.to_string(),
                first_access: access,
                last_access: access,
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::whois::WhoIsError;
    use std::cell::RefCell;
    use std::collections::{BTreeMap, HashSet};
    use std::io;

    /// Records every lookup; fails for IPs listed in `failing`.
    #[derive(Default)]
    pub(crate) struct FakeWhois {
        pub calls: RefCell<Vec<String>>,
        pub failing: HashSet<String>,
    }

    impl FakeWhois {
        pub fn failing_for(ip: &str) -> Self {
            FakeWhois {
                failing: [ip.to_string()].into_iter().collect(),
                ..Default::default()
            }
        }

        pub fn call_count(&self, ip: &str) -> usize {
            self.calls.borrow().iter().filter(|c| *c == ip).count()
        }
    }

    impl WhoIs for FakeWhois {
        fn who_is(&self, ip: &str) -> Result<BTreeMap<String, String>, WhoIsError> {
            self.calls.borrow_mut().push(ip.to_string());
            if self.failing.contains(ip) {
                return Err(WhoIsError::Io {
                    server: "fake".into(),
                    source: io::Error::new(io::ErrorKind::TimedOut, "timed out"),
                });
            }
            let mut info = BTreeMap::new();
            info.insert("OrgName".to_string(), format!("Org of {}", ip));
            Ok(info)
        }
    }

    pub(crate) fn visit(ips: &[&str], page: &str, start_ms: i64) -> Visit {
        Visit {
            client_ips: ips.iter().map(|s| s.to_string()).collect(),
            entry_page: page.to_string(),
            start_time: start_ms,
            security_summary: BTreeMap::new(),
        }
    }

    fn ms(t: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(t).unwrap()
    }

    #[test]
    fn merges_repeat_visits_to_same_page() {
        let whois = FakeWhois::default();
        let mut snap = Snapshot::new("A");
        snap.add_visit(&visit(&["1.2.3.4"], "/login", 1000), &whois).unwrap();
        snap.add_visit(&visit(&["1.2.3.4"], "/login", 2000), &whois).unwrap();

        let src = &snap.data["1.2.3.4"];
        assert_eq!(src.hits, 2);
        assert_eq!(src.pages.len(), 1);
        assert_eq!(src.pages[0].first_access, ms(1000));
        assert_eq!(src.pages[0].last_access, ms(2000));
        assert_eq!(whois.call_count("1.2.3.4"), 1);
    }

    #[test]
    fn repeated_ips_in_one_visit_count_each_time() {
        let whois = FakeWhois::default();
        let mut snap = Snapshot::new("A");
        snap.add_visit(&visit(&["a", "b", "a"], "/", 5), &whois).unwrap();

        assert_eq!(snap.data["a"].hits, 2);
        assert_eq!(snap.data["b"].hits, 1);
        assert_eq!(snap.data["a"].pages.len(), 1);
        assert_eq!(whois.call_count("a"), 1);
        assert_eq!(whois.call_count("b"), 1);
    }

    #[test]
    fn window_only_widens() {
        let whois = FakeWhois::default();
        let mut snap = Snapshot::new("A");
        for t in [5000, 3000, 9000, 4000, 9000, 3000] {
            snap.add_visit(&visit(&["ip"], "/p", t), &whois).unwrap();
        }
        let page = &snap.data["ip"].pages[0];
        assert_eq!(page.first_access, ms(3000));
        assert_eq!(page.last_access, ms(9000));
        assert!(page.first_access <= page.last_access);
    }

    #[test]
    fn pages_keep_first_observation_order_and_stay_unique() {
        let whois = FakeWhois::default();
        let mut snap = Snapshot::new("A");
        for (page, t) in [("/b", 1), ("/a", 2), ("/b", 3), ("", 4), ("/A", 5), ("/a", 6)] {
            snap.add_visit(&visit(&["ip"], page, t), &whois).unwrap();
        }
        let src = &snap.data["ip"];
        let urls: Vec<&str> = src.pages.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(urls, vec!["/b", "/a", "", "/A"]);
        assert_eq!(src.hits, 6);
        assert!(src.hits >= src.pages.len() as u64);
    }

    #[test]
    fn hits_equal_folded_occurrences() {
        let whois = FakeWhois::default();
        let mut snap = Snapshot::new("A");
        let visits = vec![
            visit(&["x", "y"], "/1", 10),
            visit(&["y"], "/2", 20),
            visit(&["z", "y", "x"], "/1", 30),
            visit(&["y", "y"], "/3", 40),
        ];
        let mut expected: BTreeMap<&str, u64> = BTreeMap::new();
        for v in &visits {
            for ip in &v.client_ips {
                *expected.entry(ip.as_str()).or_insert(0) += 1;
            }
            snap.add_visit(v, &whois).unwrap();
        }
        for (ip, hits) in expected {
            assert_eq!(snap.data[ip].hits, hits, "hits for {}", ip);
            assert_eq!(snap.data[ip].ip, ip);
            assert_eq!(whois.call_count(ip), 1);
        }
    }

    #[test]
    fn known_ip_is_never_looked_up_again() {
        let whois = FakeWhois::default();
        let mut snap = Snapshot::new("A");
        snap.data.insert(
            "1.1.1.1".into(),
            RequestSource {
                ip: "1.1.1.1".into(),
                info: BTreeMap::new(),
                pages: vec![],
                hits: 0,
            },
        );
        snap.add_visit(&visit(&["1.1.1.1"], "/", 1), &whois).unwrap();
        assert_eq!(whois.call_count("1.1.1.1"), 0);
        assert!(snap.data["1.1.1.1"].info.is_empty());
    }

    #[test]
    fn failed_lookup_leaves_no_partial_record() {
        let whois = FakeWhois::failing_for("bad");
        let mut snap = Snapshot::new("A");
        let err = snap
            .add_visit(&visit(&["good", "bad"], "/", 1), &whois)
            .unwrap_err();
        assert!(matches!(err, Error::WhoIs { ref ip, .. } if ip == "bad"));
        assert!(!snap.data.contains_key("bad"));
    }

    #[test]
    fn out_of_range_start_time_is_rejected() {
        let whois = FakeWhois::default();
        let mut snap = Snapshot::new("A");
        let err = snap
            .add_visit(&visit(&["ip"], "/", i64::MAX), &whois)
            .unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
        assert!(snap.data.is_empty());
        assert!(whois.calls.borrow().is_empty());
    }
}
