use super::{Registry, RegistryError, SUBSCRIBERS, WATCHED_TARGETS};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::info;

/// Raw drift between the two indices, as stored (no read-side filtering).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub subscribers: usize,
    pub targets: usize,
    /// (subscriber, target) listed in the subscriber record only.
    pub forward_only: Vec<(String, String)>,
    /// (subscriber, target) listed in the target record only.
    pub reverse_only: Vec<(String, String)>,
    /// Target records missing from the watch set.
    pub unwatched: Vec<String>,
    pub pending_intents: usize,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.forward_only.is_empty() && self.reverse_only.is_empty() && self.unwatched.is_empty()
    }
}

impl Registry {
    pub async fn audit(&self) -> Result<AuditReport, RegistryError> {
        let mut report = AuditReport::default();
        let watched: BTreeSet<String> = self.kv.members_of(WATCHED_TARGETS).await?.into_iter().collect();
        let mut seen_targets = BTreeSet::new();

        for sid in self.kv.members_of(SUBSCRIBERS).await? {
            let Some(sub) = self.subscriber(&sid).await? else {
                continue;
            };
            report.subscribers += 1;
            for address in sub.subscriptions.keys() {
                seen_targets.insert(address.clone());
                let listed = self
                    .target_record(address)
                    .await?
                    .is_some_and(|rec| rec.subscribers.contains(&sid));
                if !listed {
                    report.forward_only.push((sid.clone(), address.clone()));
                }
            }
        }

        seen_targets.extend(watched.iter().cloned());
        for address in &seen_targets {
            let Some(rec) = self.target_record(address).await? else {
                continue;
            };
            report.targets += 1;
            if !watched.contains(address) {
                report.unwatched.push(address.clone());
            }
            for sid in &rec.subscribers {
                let listed = self
                    .subscriber(sid)
                    .await?
                    .is_some_and(|sub| sub.subscriptions.contains_key(address));
                if !listed {
                    report.reverse_only.push((sid.clone(), address.clone()));
                }
            }
        }

        report.pending_intents = self.journal.pending().await?.len();
        Ok(report)
    }

    /// Bring every drifting pair in `report` back in line with the forward index.
    pub async fn repair(&self, report: &AuditReport) -> Result<usize, RegistryError> {
        let mut fixed = 0;
        for (sid, address) in report.forward_only.iter().chain(&report.reverse_only) {
            self.sync_edge(sid, address).await?;
            fixed += 1;
        }
        for address in &report.unwatched {
            self.kv.add_to_set(WATCHED_TARGETS, address).await?;
            fixed += 1;
        }
        info!(fixed, "registry repaired");
        Ok(fixed)
    }
}
