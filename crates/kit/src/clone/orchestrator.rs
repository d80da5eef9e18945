//! Drives a clone from validation to registration.
//!
//! Stages run strictly in order. Volumes created along the way are recorded,
//! and if any later step fails they are deleted again, newest first, before
//! the error is returned. A domain that got defined even though registration
//! reported an error is undefined first.

use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};
use rand::RngCore;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{
    CloneError, DuplicationError, DuplicationFailure, DuplicationSubject, PreconditionViolation,
};
use super::hypervisor::Hypervisor;
use super::identity::{auto_allocate_graphics, IdentityRegenerator, MacAddr};
use super::model::{Domain, DomainConfig, DomainState, Volume};
use super::storage::{self, CloneMode};
use super::transform::{transform, VolumeMapping};

/// Progress of a clone operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloneStage {
    /// Checking preconditions; nothing has been created yet
    Validating,
    /// Copying disks and firmware
    Duplicating,
    /// Building the new definition
    Assembling,
    /// Defining the clone with the hypervisor
    Registering,
    /// Finished
    Done,
    /// Gave up; everything created has been removed again
    Failed,
}

/// What to clone, and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    /// Existing domain to copy
    pub source: String,
    /// Name of the new domain
    pub target: String,
    /// How disk content is carried over
    pub mode: CloneMode,
}

/// A volume created for the clone
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClonedVolume {
    /// Guest device name, for disks
    pub target: Option<String>,
    /// Path that was duplicated
    pub source: Utf8PathBuf,
    /// Pool of the new volume
    pub pool: String,
    /// New volume name
    pub name: String,
    /// New volume path
    pub path: Utf8PathBuf,
    /// Format of the new volume
    pub format: Option<String>,
    /// Volume the new one still reads from (linked clones)
    pub backing_store: Option<Utf8PathBuf>,
}

impl ClonedVolume {
    fn new(target: Option<String>, source: Utf8PathBuf, volume: &Volume) -> Self {
        Self {
            target,
            source,
            pool: volume.pool.clone(),
            name: volume.name.clone(),
            path: volume.path.clone(),
            format: volume.format.as_ref().map(ToString::to_string),
            backing_store: volume.backing_store.as_ref().map(|b| b.path.clone()),
        }
    }
}

/// Result of a successful clone
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloneOutcome {
    /// Name of the new domain
    pub name: String,
    /// UUID the hypervisor assigned
    pub uuid: Option<Uuid>,
    /// Lifecycle state; clones are defined but never started
    pub state: DomainState,
    /// Domain that was cloned
    pub source: String,
    /// Duplication mode used
    pub mode: CloneMode,
    /// Duplicated disks
    pub volumes: Vec<ClonedVolume>,
    /// Duplicated firmware store
    pub firmware: Option<ClonedVolume>,
    /// MAC addresses of the clone's interfaces, in order
    pub mac_addresses: Vec<String>,
}

/// Hypervisor state read during validation
#[derive(Debug)]
struct Snapshot {
    domain: Domain,
    macs_in_use: HashSet<MacAddr>,
}

#[derive(Debug, Default)]
struct Duplicates {
    mapping: VolumeMapping,
    cloned: Vec<ClonedVolume>,
    firmware: Option<(Volume, ClonedVolume)>,
}

/// One clone attempt.
///
/// An operation is consumed by [`CloneOperation::perform`]; retrying means
/// starting a new one, which validates again from scratch.
#[derive(Debug)]
pub struct CloneOperation<'h, H: ?Sized> {
    hypervisor: &'h H,
    request: CloneRequest,
    stage: CloneStage,
    created: Vec<Volume>,
    defined: Option<String>,
}

impl<'h, H: Hypervisor + ?Sized> CloneOperation<'h, H> {
    /// Prepare a clone; nothing is touched until [`CloneOperation::perform`]
    pub fn new(hypervisor: &'h H, request: CloneRequest) -> Self {
        Self {
            hypervisor,
            request,
            stage: CloneStage::Validating,
            created: Vec::new(),
            defined: None,
        }
    }

    /// Current stage
    pub fn stage(&self) -> CloneStage {
        self.stage
    }

    fn advance(&mut self, stage: CloneStage) {
        debug!("Clone of {}: {:?} -> {:?}", self.request.source, self.stage, stage);
        self.stage = stage;
    }

    /// Run all stages.
    ///
    /// On error the operation ends in [`CloneStage::Failed`], and every volume
    /// or domain created by it has been removed again (or a warning was
    /// logged for each one that could not be).
    pub fn perform(mut self, rng: &mut dyn RngCore) -> Result<CloneOutcome, CloneError> {
        self.execute(rng)
    }

    fn execute(&mut self, rng: &mut dyn RngCore) -> Result<CloneOutcome, CloneError> {
        let result = self
            .validate()
            .and_then(|snapshot| self.run(snapshot, rng));
        match result {
            Ok(outcome) => {
                self.advance(CloneStage::Done);
                info!(
                    "Cloned {} to {} ({} mode)",
                    self.request.source, outcome.name, self.request.mode
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(
                    "Clone of {} failed while {:?}: {}",
                    self.request.source, self.stage, e
                );
                self.advance(CloneStage::Failed);
                self.rollback();
                Err(e)
            }
        }
    }

    fn run(&mut self, snapshot: Snapshot, rng: &mut dyn RngCore) -> Result<CloneOutcome, CloneError> {
        let duplicates = self.duplicate(&snapshot.domain)?;
        let config = self.assemble(&snapshot, &duplicates, rng)?;
        self.register(config, duplicates)
    }

    fn validate(&mut self) -> Result<Snapshot, CloneError> {
        self.advance(CloneStage::Validating);
        let hv = self.hypervisor;
        let CloneRequest { source, target, .. } = &self.request;

        if target.trim().is_empty() || target.contains('/') {
            return Err(PreconditionViolation::InvalidName(target.clone()).into());
        }
        let domain = hv
            .domain(source)
            .map_err(|e| CloneError::inspection(format!("domain '{source}'"), e))?
            .ok_or_else(|| PreconditionViolation::SourceNotFound(source.clone()))?;
        if domain.state != DomainState::ShutOff {
            return Err(PreconditionViolation::NotShutOff {
                name: source.clone(),
                state: domain.state,
            }
            .into());
        }
        let existing = hv
            .domain(target)
            .map_err(|e| CloneError::inspection(format!("domain '{target}'"), e))?;
        if existing.is_some() {
            return Err(PreconditionViolation::NameTaken(target.clone()).into());
        }
        let macs_in_use = hv
            .mac_addresses_in_use()
            .map_err(|e| CloneError::inspection("host MAC addresses", e))?;
        Ok(Snapshot {
            domain,
            macs_in_use,
        })
    }

    fn duplicate(&mut self, domain: &Domain) -> Result<Duplicates, CloneError> {
        self.advance(CloneStage::Duplicating);
        let hv = self.hypervisor;
        let target_name = self.request.target.clone();
        let mode = self.request.mode;
        let mut dups = Duplicates::default();

        for attachment in hv.storage_attachments(domain) {
            let Some(path) = attachment.duplication_source().map(ToOwned::to_owned) else {
                debug!("Sharing {} with the clone", attachment.describe());
                continue;
            };
            if dups.mapping.contains_key(&path) {
                debug!("{path} is attached more than once, reusing its duplicate");
                continue;
            }
            let name = storage::clone_volume_name(&target_name, &path);
            let subject = DuplicationSubject::Disk {
                target: attachment.target.clone(),
                path: path.clone(),
            };
            let volume = self.duplicate_one(subject, &path, &name, |hv, source| {
                storage::duplicate(hv, source, &name, mode)
            })?;
            if mode == CloneMode::Linked {
                warn!(
                    "{} is a linked clone of {}; removing {} will break {}",
                    volume.path, path, domain.name(), target_name
                );
            }
            dups.cloned.push(ClonedVolume::new(
                attachment.target.clone(),
                path.clone(),
                &volume,
            ));
            dups.mapping.insert(path, volume);
        }

        if let Some(firmware) = &domain.config.firmware {
            let path = firmware.path.clone();
            let name = storage::clone_volume_name(&target_name, &path);
            let subject = DuplicationSubject::Firmware { path: path.clone() };
            let volume = self.duplicate_one(subject, &path, &name, |hv, source| {
                storage::duplicate_firmware(hv, source, &name)
            })?;
            let cloned = ClonedVolume::new(None, path, &volume);
            dups.firmware = Some((volume, cloned));
        }
        Ok(dups)
    }

    fn duplicate_one(
        &mut self,
        subject: DuplicationSubject,
        path: &Utf8Path,
        name: &str,
        f: impl FnOnce(&H, &Volume) -> Result<Volume, DuplicationError>,
    ) -> Result<Volume, CloneError> {
        let hv = self.hypervisor;
        let result = hv
            .volume_by_path(path)
            .map_err(DuplicationError::from)
            .and_then(|v| v.ok_or_else(|| DuplicationError::NotInPool(path.to_owned())))
            .and_then(|source| f(hv, &source));
        match result {
            Ok(volume) => {
                self.created.push(volume.clone());
                Ok(volume)
            }
            Err(reason) => Err(DuplicationFailure {
                subject,
                volume: name.to_owned(),
                reason,
            }
            .into()),
        }
    }

    fn assemble(
        &mut self,
        snapshot: &Snapshot,
        dups: &Duplicates,
        rng: &mut dyn RngCore,
    ) -> Result<DomainConfig, CloneError> {
        self.advance(CloneStage::Assembling);
        let original = &snapshot.domain.config;

        // Addresses of the source itself are never handed out again
        let own_macs = original
            .interfaces
            .iter()
            .filter_map(|i| i.mac.as_deref()?.parse::<MacAddr>().ok());
        let taken = snapshot.macs_in_use.iter().copied().chain(own_macs);
        let mut regen = IdentityRegenerator::new(rng, taken);

        let interfaces = original
            .interfaces
            .iter()
            .map(|iface| regen.regenerate_interface(iface))
            .collect::<Result<Vec<_>, _>>()?;
        let graphics = original.graphics.iter().map(auto_allocate_graphics).collect();

        let config = transform(
            original,
            &self.request.target,
            &dups.mapping,
            dups.firmware.as_ref().map(|(v, _)| v),
            interfaces,
            graphics,
        )?;
        Ok(config)
    }

    fn register(
        &mut self,
        config: DomainConfig,
        dups: Duplicates,
    ) -> Result<CloneOutcome, CloneError> {
        self.advance(CloneStage::Registering);
        let defined = match self.hypervisor.define_domain(&config) {
            Ok(defined) => defined,
            Err(source) => {
                // The definition may have gone through before the error
                match self.hypervisor.domain(&config.name) {
                    Ok(Some(_)) => self.defined = Some(config.name.clone()),
                    Ok(None) => {}
                    Err(e) => warn!(
                        "Could not check whether {} was defined: {}",
                        config.name, e
                    ),
                }
                return Err(CloneError::Registration {
                    name: config.name.clone(),
                    source,
                });
            }
        };
        Ok(CloneOutcome {
            name: defined.name,
            uuid: defined.uuid,
            state: DomainState::ShutOff,
            source: self.request.source.clone(),
            mode: self.request.mode,
            volumes: dups.cloned,
            firmware: dups.firmware.map(|(_, c)| c),
            mac_addresses: config
                .interfaces
                .iter()
                .filter_map(|i| i.mac.clone())
                .collect(),
        })
    }

    fn rollback(&mut self) {
        if let Some(name) = self.defined.take() {
            match self.hypervisor.undefine_domain(&name) {
                Ok(()) => info!("Undefined domain {} after failed clone", name),
                Err(e) => warn!(
                    "Failed to undefine domain {} after failed clone: {}",
                    name, e
                ),
            }
        }
        while let Some(volume) = self.created.pop() {
            match self.hypervisor.delete_volume(&volume) {
                Ok(()) => info!("Removed volume {} after failed clone", volume.path),
                Err(e) => warn!(
                    "Failed to remove volume {} after failed clone: {}",
                    volume.path, e
                ),
            }
        }
    }
}

/// Clone `request.source` into a new, shut off domain named `request.target`
pub fn clone_domain<H: Hypervisor + ?Sized>(
    hypervisor: &H,
    request: CloneRequest,
) -> Result<CloneOutcome, CloneError> {
    CloneOperation::new(hypervisor, request).perform(&mut rand::rng())
}
