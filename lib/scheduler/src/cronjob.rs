//! The persisted CronJob record.

use chrono::{DateTime, Utc};
use dockyard_core::{ObjectMeta, ObjectRef, Resource};
use dockyard_jobs::JobSpec;
use serde::{Deserialize, Serialize};

/// Desired schedule and the job stamped out on each firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobSpec {
    /// Standard 5-field cron expression, evaluated in UTC.
    pub schedule: String,
    /// Copied into every created job.
    pub job_template: JobSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobStatus {
    /// Never moves backwards.
    #[serde(default)]
    pub last_scheduled_time: Option<DateTime<Utc>>,
    /// Last sync error, empty after a successful sync.
    #[serde(default)]
    pub message: String,
}

/// Creates a job every time its schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJob {
    pub metadata: ObjectMeta,
    pub spec: CronJobSpec,
    #[serde(default)]
    pub status: CronJobStatus,
}

impl CronJob {
    /// Creates a CronJob with the given key.
    #[must_use]
    pub fn new(key: &ObjectRef, schedule: impl Into<String>, job_template: JobSpec) -> Self {
        Self {
            metadata: ObjectMeta::for_key(key),
            spec: CronJobSpec {
                schedule: schedule.into(),
                job_template,
            },
            status: CronJobStatus::default(),
        }
    }

    /// Returns the key of the job created for the firing at `due`.
    ///
    /// The name only depends on the CronJob and the firing time, so a
    /// replayed firing maps to the same job.
    #[must_use]
    pub fn job_key(&self, due: DateTime<Utc>) -> ObjectRef {
        self.key()
            .sibling(format!("{}-{}", self.metadata.name, due.timestamp()))
    }
}

impl Resource for CronJob {
    const KIND: &'static str = "CronJob";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dockyard_jobs::Claim;
    use serde_json::json;

    fn nightly() -> CronJob {
        CronJob::new(
            &ObjectRef::namespaced("registry", "nightly-scan"),
            "0 2 * * *",
            JobSpec::new(Claim::Scan {
                handle_object: ObjectRef::namespaced("registry", "mirror"),
            })
            .with_ttl(3600),
        )
    }

    #[test]
    fn job_key_uses_epoch_seconds() {
        let due = Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap();
        let key = nightly().job_key(due);
        assert_eq!(key.namespace.as_deref(), Some("registry"));
        assert_eq!(key.name, format!("nightly-scan-{}", due.timestamp()));
    }

    #[test]
    fn wire_shape() {
        let json = serde_json::to_value(nightly()).unwrap();
        assert_eq!(json["spec"]["schedule"], "0 2 * * *");
        assert_eq!(json["spec"]["jobTemplate"]["ttl"], 3600);
        assert_eq!(json["spec"]["jobTemplate"]["claim"]["jobType"], "scan");
        assert_eq!(json["status"], json!({"lastScheduledTime": null, "message": ""}));
    }
}
