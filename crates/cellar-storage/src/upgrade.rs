use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::{
    cipher::CipherEngine,
    key_provider::EncryptionKey,
    legacy,
    record_store::{is_record_field, EncryptedRecord, RecordStore, RecordStoreError},
};

/// Store format the running code writes and expects.
pub const LATEST_STORE_VERSION: u32 = 1;
/// Version stamped on every encrypted record.
pub const RECORD_FORMAT_VERSION: u32 = 1;
/// Metadata entry holding the namespace's store format version.
pub const STORE_VERSION_METADATA_KEY: &str = "cellar.storeVersion";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MigrationError {
    #[error(transparent)]
    Storage(#[from] RecordStoreError),
    #[error("cannot convert legacy value {key}: {reason}")]
    Coerce { key: String, reason: String },
    #[error("re-ingesting {key} failed: {reason}")]
    Ingest { key: String, reason: String },
    #[error("re-keying {key} failed: {reason}")]
    Rekey { key: String, reason: String },
    #[error("store version {found} is newer than the supported {latest}")]
    UnsupportedVersion { found: u32, latest: u32 },
    #[error("no migration step starts at version {from}")]
    NoPath { from: u32 },
    #[error("migration step {name} does not move forward ({from} to {to})")]
    NonForwardStep {
        name: &'static str,
        from: u32,
        to: u32,
    },
    #[error("invalid store version marker {0:?}")]
    InvalidVersion(String),
}

/// What a migration step works with.
pub struct MigrationContext<'a> {
    pub records: &'a RecordStore,
    /// The current write path: encrypts `value` under the namespace key and
    /// stores it as a record for `key`.
    pub ingest: &'a mut dyn FnMut(&str, &str) -> Result<(), MigrationError>,
}

pub type MigrationFn = fn(&mut MigrationContext<'_>) -> Result<MigrationReport, MigrationError>;

/// One edge of the migration chain.
#[derive(Debug, Clone, Copy)]
pub struct MigrationStep {
    pub from: u32,
    pub to: u32,
    pub name: &'static str,
    pub apply: MigrationFn,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
    /// Records left in place because they could not be converted.
    pub failed: usize,
    pub steps_applied: usize,
}

impl MigrationReport {
    fn absorb(&mut self, other: MigrationReport) {
        self.migrated += other.migrated;
        self.failed += other.failed;
        self.steps_applied += other.steps_applied;
    }
}

/// Walks a namespace from its stored format version to the latest one.
///
/// Steps are applied in order, each from the version the previous one
/// reached; the version marker is stamped after every step so an interrupted
/// run resumes where it stopped. Adding a format version means appending a
/// step.
#[derive(Debug, Clone)]
pub struct UpgradeCoordinator {
    steps: Vec<MigrationStep>,
}

impl Default for UpgradeCoordinator {
    fn default() -> Self {
        Self::new(vec![MigrationStep {
            from: 0,
            to: 1,
            name: "encrypt-legacy-plaintext",
            apply: migrate_legacy_plaintext,
        }])
    }
}

impl UpgradeCoordinator {
    pub fn new(mut steps: Vec<MigrationStep>) -> Self {
        steps.sort_by_key(|step| step.from);
        Self { steps }
    }

    pub fn latest_version(&self) -> u32 {
        self.steps.iter().map(|step| step.to).max().unwrap_or(0)
    }

    /// Version recorded for the namespace; never-stamped namespaces are 0.
    pub fn current_version(&self, records: &RecordStore) -> Result<u32, MigrationError> {
        match records.read_metadata(STORE_VERSION_METADATA_KEY)? {
            None => Ok(0),
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| MigrationError::InvalidVersion(raw)),
        }
    }

    /// Bring the namespace from its recorded version to the latest one.
    pub fn run(&self, ctx: &mut MigrationContext<'_>) -> Result<MigrationReport, MigrationError> {
        let from = self.current_version(ctx.records)?;
        let latest = self.latest_version();
        if from > latest {
            return Err(MigrationError::UnsupportedVersion {
                found: from,
                latest,
            });
        }
        self.upgrade(ctx, from, latest)
    }

    #[instrument(skip_all, fields(namespace = %ctx.records.namespace(), from = from, to = to))]
    pub fn upgrade(
        &self,
        ctx: &mut MigrationContext<'_>,
        from: u32,
        to: u32,
    ) -> Result<MigrationReport, MigrationError> {
        let mut report = MigrationReport::default();
        let mut current = from;
        while current < to {
            let step = self
                .steps
                .iter()
                .find(|step| step.from == current && step.to <= to)
                .ok_or(MigrationError::NoPath { from: current })?;
            if step.to <= step.from {
                return Err(MigrationError::NonForwardStep {
                    name: step.name,
                    from: step.from,
                    to: step.to,
                });
            }

            let outcome = (step.apply)(ctx)?;
            ctx.records
                .write_metadata(STORE_VERSION_METADATA_KEY, &step.to.to_string())?;
            debug!(
                step = step.name,
                migrated = outcome.migrated,
                failed = outcome.failed,
                "applied migration step"
            );

            report.absorb(outcome);
            report.steps_applied += 1;
            current = step.to;
        }
        Ok(report)
    }
}

/// Version 0 to 1: every entry without a record suffix is a plaintext value
/// from the unencrypted generation. Each is converted to its canonical string,
/// re-ingested as an encrypted record and then removed. An entry that fails
/// stays where it is and is never read again.
pub fn migrate_legacy_plaintext(
    ctx: &mut MigrationContext<'_>,
) -> Result<MigrationReport, MigrationError> {
    let mut report = MigrationReport::default();
    for raw_key in ctx.records.enumerate()? {
        if is_record_field(&raw_key) {
            continue;
        }
        match migrate_entry(ctx, &raw_key) {
            Ok(()) => report.migrated += 1,
            Err(err) => {
                warn!(
                    namespace = ctx.records.namespace(),
                    key = %raw_key,
                    error = %err,
                    "legacy record could not be migrated, leaving it in place"
                );
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

fn migrate_entry(ctx: &mut MigrationContext<'_>, raw_key: &str) -> Result<(), MigrationError> {
    let Some(value) = ctx.records.read_raw(raw_key)? else {
        return Ok(());
    };
    let canonical = legacy::canonicalize(raw_key, &value)?;
    (ctx.ingest)(raw_key, &canonical)?;
    ctx.records.remove_raw(raw_key)?;
    Ok(())
}

/// Re-encrypt every current-format record from one key to another.
///
/// Used when a namespace moves to a stronger key custody whose key differs.
/// Records that cannot be opened with the old key are left untouched.
#[instrument(skip_all, fields(namespace = %records.namespace()))]
pub fn rekey_records(
    records: &RecordStore,
    old_engine: &CipherEngine,
    old_key: &EncryptionKey,
    new_engine: &CipherEngine,
    new_key: &EncryptionKey,
) -> Result<MigrationReport, MigrationError> {
    let mut report = MigrationReport::default();
    for key in records.logical_keys()? {
        match rekey_one(records, &key, old_engine, old_key, new_engine, new_key) {
            Ok(true) => report.migrated += 1,
            Ok(false) => {}
            Err(err) => {
                warn!(key = %key, error = %err, "record could not be re-keyed");
                report.failed += 1;
            }
        }
    }
    debug!(migrated = report.migrated, failed = report.failed, "re-keyed records");
    Ok(report)
}

fn rekey_one(
    records: &RecordStore,
    key: &str,
    old_engine: &CipherEngine,
    old_key: &EncryptionKey,
    new_engine: &CipherEngine,
    new_key: &EncryptionKey,
) -> Result<bool, MigrationError> {
    let rekey_err = |reason: String| MigrationError::Rekey {
        key: key.to_string(),
        reason,
    };
    let Some(record) = records.read(key)? else {
        return Ok(false);
    };
    if record.format_version != RECORD_FORMAT_VERSION {
        return Ok(false);
    }
    let iv = record.iv_bytes().map_err(|e| rekey_err(e.to_string()))?;
    let ciphertext = record
        .ciphertext_bytes()
        .map_err(|e| rekey_err(e.to_string()))?;
    let plaintext = old_engine
        .decrypt(old_key, &iv, &ciphertext)
        .map_err(|e| rekey_err(e.to_string()))?;

    let iv = new_engine.generate_iv();
    let sealed = new_engine
        .encrypt(new_key, &iv, &plaintext)
        .map_err(|e| rekey_err(e.to_string()))?;
    records.write(key, &EncryptedRecord::new(&sealed, &iv, RECORD_FORMAT_VERSION))?;
    Ok(true)
}
