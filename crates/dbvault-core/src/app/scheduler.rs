use std::fmt;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::{VaultConfig, parse_human_duration};
use crate::error::Result;
use crate::model::BackupType;

pub fn random_jitter(jitter_seconds: u64) -> Duration {
    if jitter_seconds == 0 {
        return Duration::ZERO;
    }
    let secs = rand::thread_rng().gen_range(0..=jitter_seconds);
    Duration::from_secs(secs)
}

pub fn next_run_in(interval: Duration, jitter_seconds: u64, now: Instant) -> Instant {
    now + interval + random_jitter(jitter_seconds)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Backup {
        database: String,
        backup_type: BackupType,
    },
    Retention,
    RestoreTest,
    Watchdog,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Backup {
                database,
                backup_type,
            } => write!(f, "{backup_type}:{database}"),
            Job::Retention => f.write_str("retention"),
            Job::RestoreTest => f.write_str("restore-test"),
            Job::Watchdog => f.write_str("watchdog"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub job: Job,
    pub interval: Duration,
    pub next_due: Instant,
}

impl ScheduledJob {
    fn new(job: Job, every: &str, first_due: Instant) -> Result<Self> {
        Ok(Self {
            job,
            interval: parse_human_duration(every)?,
            next_due: first_due,
        })
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }
}

/// Every periodic job the config asks for.
///
/// Fulls and the watchdog start right away (plus jitter) so a fresh daemon
/// has a base to chain from; everything else waits one interval.
pub fn plan(config: &VaultConfig, now: Instant) -> Result<Vec<ScheduledJob>> {
    let jitter = config.schedule.jitter_seconds;
    let mut jobs = vec![ScheduledJob::new(Job::Watchdog, &config.watchdog.every, now)?];

    for db in &config.databases {
        if let Some(every) = &db.schedule.full_every {
            jobs.push(ScheduledJob::new(
                Job::Backup {
                    database: db.name.clone(),
                    backup_type: BackupType::Full,
                },
                every,
                now + random_jitter(jitter),
            )?);
        }
        if let Some(every) = &db.schedule.incremental_every {
            let interval = parse_human_duration(every)?;
            jobs.push(ScheduledJob::new(
                Job::Backup {
                    database: db.name.clone(),
                    backup_type: BackupType::Incremental,
                },
                every,
                next_run_in(interval, jitter, now),
            )?);
        }
    }
    if config.retention.has_any_rule() {
        let every = &config.schedule.retention_every;
        let first = next_run_in(parse_human_duration(every)?, jitter, now);
        jobs.push(ScheduledJob::new(Job::Retention, every, first)?);
    }
    if config.restore_test.enabled {
        let every = &config.restore_test.every;
        let first = next_run_in(parse_human_duration(every)?, jitter, now);
        jobs.push(ScheduledJob::new(Job::RestoreTest, every, first)?);
    }
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use std::path::Path;

    const CONFIG: &str = r#"
storage:
  url: /tmp/dbvault-store
databases:
  - name: orders
    id: 6f1c9a52-8d4b-4e1f-9a7e-2b8c3d4e5f60
    engine: wal_engine
    port: 5432
    schedule:
      full_every: 1d
      incremental_every: 15m
  - name: cache
    id: 7f1c9a52-8d4b-4e1f-9a7e-2b8c3d4e5f61
    engine: kv_store
    port: 6379
retention:
  keep_daily: 7
"#;

    #[test]
    fn jitter_bounds_are_respected() {
        for _ in 0..64 {
            let jitter = random_jitter(5).as_secs();
            assert!(jitter <= 5);
        }
        assert_eq!(random_jitter(0), Duration::ZERO);
    }

    #[test]
    fn next_run_is_in_future() {
        let now = Instant::now();
        let next = next_run_in(Duration::from_secs(1800), 0, now);
        assert_eq!(next - now, Duration::from_secs(1800));
    }

    #[test]
    fn plan_covers_configured_jobs() {
        let config = parse_config(CONFIG, Path::new("test.yaml")).unwrap();
        let now = Instant::now();
        let jobs = plan(&config, now).unwrap();
        let names: Vec<String> = jobs.iter().map(|j| j.job.to_string()).collect();
        assert_eq!(
            names,
            vec!["watchdog", "full:orders", "incremental:orders", "retention"]
        );

        let full = &jobs[1];
        assert!(full.is_due(now));
        assert_eq!(full.interval, Duration::from_secs(86_400));
        let incremental = &jobs[2];
        assert!(!incremental.is_due(now));
        assert_eq!(incremental.next_due - now, Duration::from_secs(900));
    }
}
