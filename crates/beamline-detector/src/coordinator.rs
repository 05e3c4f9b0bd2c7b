//! The scratch-to-archive coordinator.
//!
//! The detector runs a continuous series and drops one file per trigger into
//! the scratch directory. The timing system counts trigger pulses
//! (`xdet_trig_count`) and the pulses the acquisition loop commits to
//! (`xdet_acq_count`). The coordinator decides which scratch file becomes
//! which archive image by correlating the three streams:
//!
//! ```text
//! scratch file F (image number N, acquire timestamp)
//!   -> corrected time  = acquire_timestamp - acquire_timestamp_offset
//!   -> snapped time    = closest xdet_trig_count event
//!   -> trigger count   = N + xdet_trig_count_offset
//!   -> gate            : timing_system_acquiring at corrected time
//!   -> acq offset      = trig - acq at the latest coincident pair
//!   -> xdet_acq_count  = trigger count - acq offset
//!   -> archive path    = layout.xray_image_filename(xdet_acq_count - 1)
//! ```
//!
//! Images that cannot be correlated yet stay pending and are retried on
//! every poll; they are given up on when evicted from the scratch directory
//! or after `pending_timeout`.
//!
//! # State machine
//!
//! ```text
//! Idle --start_acquiring()--> Acquiring --stop_acquiring()--> (detector stops) --> Idle
//! ```
//!
//! Writing `acquiring` starts or stops the acquisition, and writing
//! `dataset_directory` selects the dataset archived into (empty for none),
//! so both can be driven over the control bus.

use beamline_core::{
    history, supervised_loop, BeamlineError, Db, EventHistory, MonitorSet, Observable,
    PersistentCell, PropertyAccess, PropertySet, PropertyValue, Reference, ThreadProperty, Value,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::archive::{link_or_copy, ArchiveOutcome};
use crate::config::CoordinatorConfig;
use crate::control::DetectorControl;
use crate::error::{DetectorError, Result};
use crate::image::ImageDecoder;
use crate::layout::{AcquisitionLayout, DatasetLayout};
use crate::offsets::{acq_count_offset, estimate_trig_count_offset, median};
use crate::scratch::{ScratchDirectory, ScratchEntry};

/// Timing-system counters the coordinator correlates against.
#[derive(Clone)]
pub struct CoordinatorInputs {
    /// Trigger pulse counter
    pub xdet_trig_count: Reference,
    /// Committed acquisition counter
    pub xdet_acq_count: Reference,
    /// Whether the timing system is acquiring a dataset
    pub timing_system_acquiring: Reference,
}

/// Acquisition state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcquisitionState {
    /// No series running.
    Idle,
    /// The detector is producing a series.
    Acquiring,
}

/// One scratch file placed in the archive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    /// Scratch file name
    pub scratch_file: String,
    /// Image number from the file name
    pub image_number: u64,
    /// Trigger count of the image
    pub trigger_count: i64,
    /// Acquisition count of the image
    pub xdet_acq_count: i64,
    /// Archive path
    pub destination: PathBuf,
    /// How the file got there
    pub outcome: ArchiveOutcome,
}

/// What one poll did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollReport {
    /// Files seen for the first time
    pub new_files: usize,
    /// Files archived
    pub assigned: Vec<Assignment>,
    /// Files given up on
    pub discarded: Vec<String>,
    /// Files still waiting for correlation
    pub pending: usize,
    /// Files deleted to bound the scratch directory
    pub evicted: usize,
}

/// Counters since start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    /// Images archived
    pub images_assigned: u64,
    /// Images discarded
    pub images_discarded: u64,
    /// Snap distances over tolerance
    pub snap_warnings: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageStatus {
    Pending,
    Assigned,
    Discarded,
}

#[derive(Debug, Clone)]
struct ScratchImage {
    path: PathBuf,
    image_number: u64,
    file_timestamp: f64,
    /// NaN until read
    acquire_timestamp: f64,
    stable: bool,
    snap_warned: bool,
    pending_since: Instant,
    status: ImageStatus,
}

impl ScratchImage {
    fn new(entry: &ScratchEntry) -> Self {
        Self {
            path: entry.path.clone(),
            image_number: entry.image_number,
            file_timestamp: entry.mtime,
            acquire_timestamp: f64::NAN,
            stable: false,
            snap_warned: false,
            pending_since: Instant::now(),
            status: ImageStatus::Pending,
        }
    }
}

struct CoordinatorState {
    images: BTreeMap<String, ScratchImage>,
    /// Snapped trigger count -> image number that owns it
    claimed_triggers: HashMap<i64, u64>,
    last_index: Option<i64>,
    acquisition: AcquisitionState,
    stop_requested: bool,
    stats: CoordinatorStats,
}

enum Decision {
    Pending(&'static str),
    Discard(String),
    Assigned(Assignment),
}

/// Correlates scratch images with timing-system counters and archives them.
pub struct Coordinator {
    config: CoordinatorConfig,
    scratch: ScratchDirectory,
    decoder: Arc<dyn ImageDecoder>,
    detector: Arc<dyn DetectorControl>,
    trig_history: Arc<EventHistory>,
    acq_history: Arc<EventHistory>,
    acquiring_history: Arc<EventHistory>,
    layout: RwLock<Option<Arc<dyn AcquisitionLayout>>>,
    poll_lock: Mutex<()>,
    state: Mutex<CoordinatorState>,
    props: Arc<PropertySet>,
    running: Arc<ThreadProperty>,
    trig_count_offset: PersistentCell<i64>,
    acq_count_offset: Observable<i64>,
    timestamp_offset: Observable<f64>,
    acquiring: Observable<bool>,
    dataset_directory: Observable<String>,
    temp_basenames: Observable<Vec<String>>,
    images_assigned: Observable<u64>,
    images_discarded: Observable<u64>,
    snap_warnings: Observable<u64>,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("scratch", &self.scratch.path())
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Coordinator for `config.scratch_directory`.
    ///
    /// Histories of the three inputs are created (or shared) here, so events
    /// from now on are available for correlation. A pinned
    /// `xdet_trig_count_offset` is written to the database.
    pub fn new(
        config: CoordinatorConfig,
        db: &Db,
        inputs: &CoordinatorInputs,
        decoder: Arc<dyn ImageDecoder>,
        detector: Arc<dyn DetectorControl>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let props = Arc::new(PropertySet::new("xray_detector_coordinator"));
        let owner = props.owner().clone();
        let trig_count_offset = PersistentCell::new(
            db,
            format!("{}.xdet_trig_count_offset", config.db_name),
            "xdet_trig_count_offset",
            0i64,
        );
        if let Some(pinned) = config.xdet_trig_count_offset {
            trig_count_offset.set(&pinned)?;
        }
        let initial_offset = config.acquire_timestamp_offset.unwrap_or(0.0);

        let coordinator = Arc::new_cyclic(|weak: &Weak<Coordinator>| {
            let weak = weak.clone();
            let period = config.poll_interval;
            let running = Arc::new(ThreadProperty::new(&owner, "running", move |cancel| {
                supervised_loop("xray_detector_coordinator", cancel, period, || {
                    match weak.upgrade() {
                        Some(coordinator) => {
                            coordinator.poll_once()?;
                        }
                        None => {
                            cancel.cancel();
                        }
                    }
                    Ok(())
                });
            }));

            Coordinator {
                scratch: ScratchDirectory::new(&config.scratch_directory, &config.extension),
                trig_history: history(&inputs.xdet_trig_count, config.history_length),
                acq_history: history(&inputs.xdet_acq_count, config.history_length),
                acquiring_history: history(&inputs.timing_system_acquiring, config.history_length),
                decoder,
                detector,
                layout: RwLock::new(None),
                poll_lock: Mutex::new(()),
                state: Mutex::new(CoordinatorState {
                    images: BTreeMap::new(),
                    claimed_triggers: HashMap::new(),
                    last_index: None,
                    acquisition: AcquisitionState::Idle,
                    stop_requested: false,
                    stats: CoordinatorStats::default(),
                }),
                running,
                trig_count_offset,
                acq_count_offset: Observable::new(&owner, "xdet_acq_count_offset", 0i64)
                    .read_only(),
                timestamp_offset: Observable::new(&owner, "acquire_timestamp_offset", initial_offset)
                    .with_units("s")
                    .read_only(),
                acquiring: Observable::new(&owner, "acquiring", false),
                dataset_directory: Observable::new(&owner, "dataset_directory", String::new()),
                temp_basenames: Observable::new(&owner, "temp_basenames", Vec::<String>::new())
                    .read_only(),
                images_assigned: Observable::new(&owner, "images_assigned", 0u64).read_only(),
                images_discarded: Observable::new(&owner, "images_discarded", 0u64).read_only(),
                snap_warnings: Observable::new(&owner, "snap_warnings", 0u64).read_only(),
                props,
                config,
            }
        });
        coordinator.register_properties();
        if let Some(directory) = coordinator.config.dataset_directory.clone() {
            coordinator.set_dataset_directory(Some(&directory));
        }
        Ok(coordinator)
    }

    fn register_properties(self: &Arc<Self>) {
        let props = &self.props;
        props.register_thread(&self.running);
        props.register(Arc::new(self.trig_count_offset.clone()));
        props.register(Arc::new(self.acq_count_offset.clone()));
        props.register(Arc::new(self.timestamp_offset.clone()));
        props.register(Arc::new(Control {
            cell: self.acquiring.clone(),
            coordinator: Arc::downgrade(self),
            apply: |coordinator: &Coordinator, acquire: bool| {
                if acquire {
                    coordinator.start_acquiring()
                } else {
                    coordinator.stop_acquiring()
                }
            },
        }));
        props.register(Arc::new(Control {
            cell: self.dataset_directory.clone(),
            coordinator: Arc::downgrade(self),
            apply: |coordinator: &Coordinator, directory: String| {
                let directory = directory.trim();
                coordinator
                    .set_dataset_directory((!directory.is_empty()).then(|| Path::new(directory)));
                Ok(())
            },
        }));
        props.register(Arc::new(self.temp_basenames.clone()));
        props.register(Arc::new(self.images_assigned.clone()));
        props.register(Arc::new(self.images_discarded.clone()));
        props.register(Arc::new(self.snap_warnings.clone()));
    }

    /// Properties published by the coordinator (`running`, offsets, counters).
    pub fn properties(&self) -> &Arc<PropertySet> {
        &self.props
    }

    /// The polling loop as a thread property.
    pub fn running(&self) -> &Arc<ThreadProperty> {
        &self.running
    }

    /// Configuration in use.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Acquisition state.
    pub fn state(&self) -> AcquisitionState {
        self.state.lock().acquisition
    }

    /// Counters since start-up.
    pub fn stats(&self) -> CoordinatorStats {
        self.state.lock().stats
    }

    /// Persisted trigger count offset.
    pub fn trig_count_offset(&self) -> i64 {
        self.trig_count_offset.get()
    }

    /// Last derived acquisition count offset.
    pub fn acq_count_offset(&self) -> i64 {
        self.acq_count_offset.get()
    }

    /// Detector-to-host clock offset in seconds.
    pub fn acquire_timestamp_offset(&self) -> f64 {
        self.timestamp_offset.get()
    }

    /// Archive into `layout` from now on; `None` stops archiving.
    ///
    /// Starts a new dataset: archive numbering and trigger claims reset.
    pub fn set_layout(&self, layout: Option<Arc<dyn AcquisitionLayout>>) {
        let _poll = self.poll_lock.lock();
        *self.layout.write() = layout;
        let mut state = self.state.lock();
        state.last_index = None;
        state.claimed_triggers.clear();
        let now = Instant::now();
        for image in state.images.values_mut() {
            if image.status == ImageStatus::Pending {
                image.pending_since = now;
            }
        }
    }

    /// Archive into `directory` as a [`DatasetLayout`] named after its last
    /// component; `None` stops archiving.
    pub fn set_dataset_directory(&self, directory: Option<&Path>) {
        let layout = directory.map(|dir| {
            let basename = dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "xray".to_string());
            Arc::new(DatasetLayout::new(dir, basename, self.config.extension.clone()))
                as Arc<dyn AcquisitionLayout>
        });
        self.set_layout(layout);
        let shown = directory
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_default();
        tracing::info!(dataset = %shown, "dataset directory set");
        self.dataset_directory.update(shown);
    }

    /// True while a dataset layout is set.
    pub fn collecting_dataset(&self) -> bool {
        self.layout.read().is_some()
    }

    /// Empty the scratch directory, start a detector series and the polling
    /// loop.
    pub fn start_acquiring(&self) -> Result<()> {
        let _poll = self.poll_lock.lock();
        {
            let state = self.state.lock();
            if state.acquisition == AcquisitionState::Acquiring && !state.stop_requested {
                return Ok(());
            }
        }
        let removed = self.scratch.clear()?;
        self.detector.start_series(self.config.series_length())?;
        {
            let mut state = self.state.lock();
            state.images.clear();
            state.claimed_triggers.clear();
            state.last_index = None;
            state.acquisition = AcquisitionState::Acquiring;
            state.stop_requested = false;
        }
        tracing::info!(
            scratch = %self.scratch.path().display(),
            removed,
            nimages = self.config.series_length(),
            "acquisition started"
        );
        self.running.start()?;
        self.acquiring.update(true);
        self.temp_basenames.update(Vec::new());
        Ok(())
    }

    /// Ask the detector to finish with a background read.
    ///
    /// The state stays `Acquiring` until the detector reports it stopped.
    pub fn stop_acquiring(&self) -> Result<()> {
        {
            let state = self.state.lock();
            if state.acquisition != AcquisitionState::Acquiring || state.stop_requested {
                return Ok(());
            }
        }
        self.detector.read_background()?;
        self.state.lock().stop_requested = true;
        tracing::info!("acquisition stop requested");
        Ok(())
    }

    /// One scan of the scratch directory: pick up new files, read their
    /// timestamps, refresh offsets, archive what can be correlated and
    /// bound the directory size.
    pub fn poll_once(&self) -> Result<PollReport> {
        let _poll = self.poll_lock.lock();
        let listing = self.scratch.list()?;
        let layout = self.layout.read().clone();
        let mut report = PollReport::default();

        let detector_stopped = !self.detector.is_acquiring();
        let mut state = self.state.lock();
        let mut stopped_now = false;
        if state.acquisition == AcquisitionState::Acquiring && state.stop_requested && detector_stopped
        {
            state.acquisition = AcquisitionState::Idle;
            state.stop_requested = false;
            stopped_now = true;
        }

        self.track_files(&mut state, &listing, &mut report);
        self.read_timestamps(&mut state);
        let timestamp_offset = self.timestamp_offset_estimate(&state);

        let retuned = match (&layout, self.config.xdet_trig_count_offset) {
            (None, None) => self.trig_offset_estimate(&state, timestamp_offset),
            _ => None,
        };

        let mut acq_offset = None;
        if let Some(layout) = &layout {
            let trig_offset = self.trig_count_offset.get();
            let trig_events = self.trig_history.events();
            let acq_events = self.acq_history.events();
            let mut names: Vec<(u64, String)> = state
                .images
                .iter()
                .filter(|(_, img)| img.status == ImageStatus::Pending && !img.acquire_timestamp.is_nan())
                .map(|(name, img)| (img.image_number, name.clone()))
                .collect();
            names.sort();

            for (_, name) in names {
                let decision = self.decide(
                    &mut state,
                    &name,
                    &**layout,
                    &trig_events,
                    &acq_events,
                    timestamp_offset,
                    trig_offset,
                );
                match decision {
                    Decision::Pending(reason) => {
                        tracing::trace!(file = %name, reason, "image pending");
                    }
                    Decision::Discard(reason) => {
                        Self::discard(&mut state, &name, &reason, timestamp_offset);
                        report.discarded.push(name);
                    }
                    Decision::Assigned(assignment) => {
                        acq_offset = Some(assignment.trigger_count - assignment.xdet_acq_count);
                        report.assigned.push(assignment);
                    }
                }
            }

            let timeout = self.config.pending_timeout;
            let expired: Vec<String> = state
                .images
                .iter()
                .filter(|(_, img)| {
                    img.status == ImageStatus::Pending && img.pending_since.elapsed() > timeout
                })
                .map(|(name, _)| name.clone())
                .collect();
            for name in expired {
                Self::discard(&mut state, &name, "no correlation before timeout", timestamp_offset);
                report.discarded.push(name);
            }
        }

        for entry in self.scratch.enforce_limit(self.config.nimages_to_keep)? {
            if let Some(image) = state.images.remove(&entry.name) {
                if image.status == ImageStatus::Pending && layout.is_some() {
                    tracing::error!(
                        file = %entry.name,
                        file_timestamp = image.file_timestamp,
                        acquire_timestamp = image.acquire_timestamp,
                        "evicted from scratch before correlation"
                    );
                    state.stats.images_discarded += 1;
                    report.discarded.push(entry.name.clone());
                }
            }
            report.evicted += 1;
        }

        report.pending = state
            .images
            .values()
            .filter(|img| img.status == ImageStatus::Pending)
            .count();
        let stats = state.stats;
        let basenames: Vec<String> = state.images.keys().cloned().collect();
        drop(state);

        // Handlers run after the state lock is released
        if stopped_now {
            tracing::info!("detector stopped, acquisition idle");
            self.acquiring.update(false);
        }
        if let Some(offset) = retuned {
            if offset != self.trig_count_offset.get() {
                tracing::info!(offset, "xdet_trig_count_offset re-estimated");
                self.trig_count_offset.set(&offset)?;
            }
        }
        if let Some(offset) = acq_offset {
            self.acq_count_offset.update(offset);
        }
        self.timestamp_offset.update(timestamp_offset);
        self.temp_basenames.update(basenames);
        self.images_assigned.update(stats.images_assigned);
        self.images_discarded.update(stats.images_discarded);
        self.snap_warnings.update(stats.snap_warnings);
        Ok(report)
    }

    fn track_files(
        &self,
        state: &mut CoordinatorState,
        listing: &[ScratchEntry],
        report: &mut PollReport,
    ) {
        let present: std::collections::HashSet<&str> =
            listing.iter().map(|e| e.name.as_str()).collect();
        let vanished: Vec<String> = state
            .images
            .keys()
            .filter(|name| !present.contains(name.as_str()))
            .cloned()
            .collect();
        for name in vanished {
            if let Some(image) = state.images.remove(&name) {
                if image.status == ImageStatus::Pending && self.collecting_dataset() {
                    tracing::error!(
                        file = %name,
                        file_timestamp = image.file_timestamp,
                        acquire_timestamp = image.acquire_timestamp,
                        "scratch file vanished before correlation"
                    );
                    state.stats.images_discarded += 1;
                }
            }
        }

        for entry in listing {
            match state.images.get_mut(&entry.name) {
                Some(image) => {
                    image.stable = image.file_timestamp == entry.mtime;
                    image.file_timestamp = entry.mtime;
                }
                None => {
                    state
                        .images
                        .insert(entry.name.clone(), ScratchImage::new(entry));
                    report.new_files += 1;
                }
            }
        }
    }

    fn read_timestamps(&self, state: &mut CoordinatorState) {
        for (name, image) in state.images.iter_mut() {
            if !image.acquire_timestamp.is_nan() || !image.stable {
                continue;
            }
            match self.decoder.acquire_timestamp(&image.path) {
                Ok(timestamp) => image.acquire_timestamp = timestamp,
                Err(e) => {
                    tracing::debug!(file = %name, error = %e, "acquire timestamp not readable yet");
                    image.stable = false;
                }
            }
        }
    }

    fn timestamp_offset_estimate(&self, state: &CoordinatorState) -> f64 {
        if let Some(pinned) = self.config.acquire_timestamp_offset {
            return pinned;
        }
        median(
            state
                .images
                .values()
                .map(|img| img.acquire_timestamp - img.file_timestamp),
        )
        .unwrap_or_else(|| self.timestamp_offset.get())
    }

    fn trig_offset_estimate(&self, state: &CoordinatorState, timestamp_offset: f64) -> Option<i64> {
        let samples: Vec<i64> = state
            .images
            .values()
            .filter(|img| !img.acquire_timestamp.is_nan())
            .filter_map(|img| {
                let snapped = self
                    .trig_history
                    .closest_event_time(img.acquire_timestamp - timestamp_offset);
                if snapped.is_nan() {
                    return None;
                }
                let count = self.trig_history.value_before_or_at(snapped).as_i64()?;
                i64::try_from(img.image_number).ok().map(|n| count - n)
            })
            .collect();
        estimate_trig_count_offset(&samples, self.config.trig_offset_max_spread)
    }

    #[allow(clippy::too_many_arguments)]
    fn decide(
        &self,
        state: &mut CoordinatorState,
        name: &str,
        layout: &dyn AcquisitionLayout,
        trig_events: &[(f64, Value)],
        acq_events: &[(f64, Value)],
        timestamp_offset: f64,
        trig_offset: i64,
    ) -> Decision {
        let Some(image) = state.images.get(name).cloned() else {
            return Decision::Pending("gone");
        };
        let corrected = image.acquire_timestamp - timestamp_offset;

        let snapped = self.trig_history.closest_event_time(corrected);
        if snapped.is_nan() {
            return Decision::Pending("no trigger events");
        }
        let distance = (snapped - corrected).abs();
        if distance > self.config.snap_tolerance.as_secs_f64() && !image.snap_warned {
            tracing::warn!(
                file = %name,
                acquire_timestamp = image.acquire_timestamp,
                corrected,
                snapped,
                distance,
                "acquire timestamp is far from any trigger"
            );
            state.stats.snap_warnings += 1;
            if let Some(img) = state.images.get_mut(name) {
                img.snap_warned = true;
            }
        }

        let Ok(number) = i64::try_from(image.image_number) else {
            return Decision::Discard(format!("image number {} out of range", image.image_number));
        };
        let trigger_count = number + trig_offset;

        // The initial value is not evidence; wait for a recorded transition
        if self
            .acquiring_history
            .last_event_time_before_or_at(corrected)
            .is_nan()
        {
            return Decision::Pending("no acquiring event yet");
        }
        match self.acquiring_history.value_before_or_at(corrected).as_bool() {
            Some(true) => {}
            Some(false) => return Decision::Discard("timing system not acquiring".into()),
            None => return Decision::Pending("acquiring state unknown"),
        }

        let snapped_count = self
            .trig_history
            .value_before_or_at(snapped)
            .as_i64()
            .unwrap_or(trigger_count);
        if let Some(&winner) = state.claimed_triggers.get(&snapped_count) {
            if winner != image.image_number {
                return Decision::Discard(
                    DetectorError::DuplicateTrigger {
                        file: name.to_string(),
                        winner,
                        trigger_count: snapped_count,
                    }
                    .to_string(),
                );
            }
        }

        let Some(offset) = acq_count_offset(
            trig_events,
            acq_events,
            snapped,
            self.config.coincidence_tolerance.as_secs_f64(),
        ) else {
            return Decision::Pending("no coincident trigger and acquisition events");
        };
        let xdet_acq_count = trigger_count - offset;
        let index = xdet_acq_count - 1;
        if index < 0 {
            return Decision::Discard(format!("acquisition count {xdet_acq_count} before dataset start"));
        }
        if let Some(previous) = state.last_index {
            if index <= previous {
                return Decision::Discard(
                    DetectorError::NonIncreasing {
                        file: name.to_string(),
                        index,
                        previous,
                    }
                    .to_string(),
                );
            }
        }

        let destination = layout.xray_image_filename(index.unsigned_abs());
        let outcome = match link_or_copy(&image.path, &destination) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "archiving failed, will retry");
                return Decision::Pending("archive write failed");
            }
        };
        tracing::debug!(
            file = %name,
            trigger_count,
            xdet_acq_count,
            destination = %destination.display(),
            ?outcome,
            "image archived"
        );

        state.last_index = Some(index);
        state.claimed_triggers.insert(snapped_count, image.image_number);
        state.stats.images_assigned += 1;
        if let Some(img) = state.images.get_mut(name) {
            img.status = ImageStatus::Assigned;
        }
        Decision::Assigned(Assignment {
            scratch_file: name.to_string(),
            image_number: image.image_number,
            trigger_count,
            xdet_acq_count,
            destination,
            outcome,
        })
    }

    fn discard(state: &mut CoordinatorState, name: &str, reason: &str, timestamp_offset: f64) {
        if let Some(image) = state.images.get_mut(name) {
            tracing::error!(
                file = %name,
                file_timestamp = image.file_timestamp,
                acquire_timestamp = image.acquire_timestamp,
                corrected = image.acquire_timestamp - timestamp_offset,
                reason,
                "image discarded"
            );
            image.status = ImageStatus::Discarded;
            state.stats.images_discarded += 1;
        }
    }
}

/// A coordinator property whose writes are commands.
struct Control<T: PropertyValue> {
    cell: Observable<T>,
    coordinator: Weak<Coordinator>,
    apply: fn(&Coordinator, T) -> Result<()>,
}

impl<T: PropertyValue> PropertyAccess for Control<T> {
    fn name(&self) -> String {
        self.cell.name()
    }

    fn get_value(&self) -> beamline_core::Result<Value> {
        Ok(self.cell.get_value())
    }

    fn set_value(&self, value: &Value) -> beamline_core::Result<()> {
        let property = self.cell.id().to_string();
        let typed = T::from_value(value).ok_or_else(|| BeamlineError::TypeMismatch {
            property: property.clone(),
            expected: T::type_label(),
            value: value.to_literal(),
        })?;
        let Some(coordinator) = self.coordinator.upgrade() else {
            return Err(BeamlineError::Validation {
                property,
                message: "coordinator is gone".into(),
            });
        };
        (self.apply)(&coordinator, typed).map_err(|e| match e {
            DetectorError::Property(inner) => inner,
            other => BeamlineError::Validation {
                property,
                message: other.to_string(),
            },
        })
    }

    fn monitors(&self) -> MonitorSet {
        self.cell.monitors()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.running.stop();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::image::{write_header_image, HeaderTimestampDecoder, DEFAULT_TIMESTAMP_OFFSET};
    use beamline_core::PropertyHost;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[derive(Default)]
    struct FakeDetector {
        series: AtomicU64,
        acquiring: AtomicBool,
        background_reads: AtomicU64,
    }

    impl DetectorControl for FakeDetector {
        fn start_series(&self, nimages: u64) -> Result<()> {
            self.series.store(nimages, Ordering::SeqCst);
            self.acquiring.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn read_background(&self) -> Result<()> {
            self.background_reads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_acquiring(&self) -> bool {
            self.acquiring.load(Ordering::SeqCst)
        }
    }

    struct Rig {
        _dir: tempfile::TempDir,
        scratch: PathBuf,
        data: PathBuf,
        timing: Arc<PropertySet>,
        detector: Arc<FakeDetector>,
        coordinator: Arc<Coordinator>,
    }

    fn rig(configure: impl FnOnce(&mut CoordinatorConfig)) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let data = dir.path().join("data");
        std::fs::create_dir_all(&scratch).unwrap();
        let db = Db::open(dir.path().join("settings"), std::time::Duration::from_secs(1)).unwrap();

        let timing = Arc::new(PropertySet::new("timing_system"));
        timing.register(Arc::new(Observable::new(timing.owner(), "xdet_trig_count", 0i64)));
        timing.register(Arc::new(Observable::new(timing.owner(), "xdet_acq_count", 0i64)));
        timing.register(Arc::new(Observable::new(timing.owner(), "acquiring", false)));
        let inputs = CoordinatorInputs {
            xdet_trig_count: timing.reference("xdet_trig_count"),
            xdet_acq_count: timing.reference("xdet_acq_count"),
            timing_system_acquiring: timing.reference("acquiring"),
        };

        let mut config = CoordinatorConfig::new(&scratch);
        config.digits = 7;
        configure(&mut config);
        let detector = Arc::new(FakeDetector::default());
        let coordinator = Coordinator::new(
            config,
            &db,
            &inputs,
            Arc::new(HeaderTimestampDecoder::default()),
            detector.clone(),
        )
        .unwrap();
        Rig {
            _dir: dir,
            scratch,
            data,
            timing,
            detector,
            coordinator,
        }
    }

    impl Rig {
        fn history(&self, name: &str) -> Arc<EventHistory> {
            history(&self.timing.reference(name), 10)
        }

        fn image(&self, number: u64, acquire_timestamp: f64) {
            let path = self.scratch.join(format!("{number:07}.rx"));
            write_header_image(&path, DEFAULT_TIMESTAMP_OFFSET, acquire_timestamp).unwrap();
            std::fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(beamline_core::timestamp::to_system_time(acquire_timestamp))
                .unwrap();
        }
    }

    #[test]
    fn test_state_machine() {
        let rig = rig(|_| {});
        std::fs::write(rig.scratch.join("0000005.rx"), b"stale").unwrap();

        rig.coordinator.start_acquiring().unwrap();
        assert_eq!(rig.coordinator.state(), AcquisitionState::Acquiring);
        assert_eq!(rig.detector.series.load(Ordering::SeqCst), 9_999_999);
        assert!(!rig.scratch.join("0000005.rx").exists());
        assert!(rig.coordinator.running().running());

        rig.coordinator.stop_acquiring().unwrap();
        assert_eq!(rig.detector.background_reads.load(Ordering::SeqCst), 1);
        // Still acquiring until the detector itself stops
        rig.coordinator.poll_once().unwrap();
        assert_eq!(rig.coordinator.state(), AcquisitionState::Acquiring);

        rig.detector.acquiring.store(false, Ordering::SeqCst);
        rig.coordinator.poll_once().unwrap();
        assert_eq!(rig.coordinator.state(), AcquisitionState::Idle);
        assert_eq!(
            rig.coordinator.properties().get_property("acquiring").unwrap(),
            Value::Bool(false)
        );

        rig.coordinator.running().stop();
        assert!(rig
            .coordinator
            .running()
            .wait_stopped(std::time::Duration::from_secs(2)));
    }

    #[test]
    fn test_acquisition_driven_by_properties() {
        let rig = rig(|_| {});
        let props = rig.coordinator.properties();

        props.set_property("acquiring", &Value::Bool(true)).unwrap();
        assert_eq!(rig.coordinator.state(), AcquisitionState::Acquiring);
        assert!(rig.detector.acquiring.load(Ordering::SeqCst));

        let dataset = rig.data.join("lysozyme-1");
        props
            .set_property(
                "dataset_directory",
                &Value::Str(dataset.to_string_lossy().into_owned()),
            )
            .unwrap();
        assert!(rig.coordinator.collecting_dataset());
        assert_eq!(
            props.get_property("dataset_directory").unwrap(),
            Value::Str(dataset.to_string_lossy().into_owned())
        );

        props.set_property("dataset_directory", &Value::Str(String::new())).unwrap();
        assert!(!rig.coordinator.collecting_dataset());

        props.set_property("acquiring", &Value::Bool(false)).unwrap();
        assert_eq!(rig.detector.background_reads.load(Ordering::SeqCst), 1);
        assert!(props.set_property("acquiring", &Value::Str("maybe".into())).is_err());

        rig.coordinator.running().stop();
        assert!(rig
            .coordinator
            .running()
            .wait_stopped(std::time::Duration::from_secs(2)));
    }

    #[test]
    fn test_dataset_directory_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sample-7");
        let rig = rig(|c| c.dataset_directory = Some(target.clone()));
        assert!(rig.coordinator.collecting_dataset());
        let layout = rig.coordinator.layout.read().clone().unwrap();
        assert_eq!(
            layout.xray_image_filename(0),
            target.join("xray_images").join("sample-7_000001.rx")
        );
    }

    #[test]
    fn test_timestamp_waits_for_stable_mtime() {
        let rig = rig(|c| c.xdet_trig_count_offset = Some(100));
        rig.image(1, 1_700_000_000.05);

        let report = rig.coordinator.poll_once().unwrap();
        assert_eq!(report.new_files, 1);
        assert_eq!(
            rig.coordinator.properties().get_property("temp_basenames").unwrap(),
            Value::List(vec![Value::Str("0000001.rx".into())])
        );
        // Second poll sees the same mtime and reads the header
        rig.coordinator.poll_once().unwrap();
        assert!(rig.coordinator.acquire_timestamp_offset().abs() < 1e-3);
    }

    #[test]
    fn test_trig_count_offset_tunes_without_dataset() {
        let rig = rig(|_| {});
        let trig = rig.history("xdet_trig_count");
        let base = 1_700_000_000.0;
        for i in 0..3u32 {
            let t = base + f64::from(i) * 0.1;
            trig.record(t + 0.002, Value::Int(101 + i64::from(i)));
            rig.image(u64::from(i) + 1, t + 0.004);
        }

        rig.coordinator.poll_once().unwrap();
        rig.coordinator.poll_once().unwrap();
        assert_eq!(rig.coordinator.trig_count_offset(), 100);
        // Persisted under the coordinator's key
        assert_eq!(
            rig.coordinator
                .properties()
                .get_property("xdet_trig_count_offset")
                .unwrap(),
            Value::Int(100)
        );
    }

    #[test]
    fn test_not_acquiring_discards() {
        let rig = rig(|c| c.xdet_trig_count_offset = Some(100));
        let t = 1_700_000_000.05;
        rig.history("xdet_trig_count").record(t, Value::Int(101));
        rig.history("xdet_acq_count").record(t, Value::Int(100));
        rig.history("acquiring").record(t - 10.0, Value::Bool(false));
        rig.coordinator.set_layout(Some(Arc::new(DatasetLayout::new(&rig.data, "x", "rx"))));
        rig.image(1, t);

        rig.coordinator.poll_once().unwrap();
        let report = rig.coordinator.poll_once().unwrap();
        assert_eq!(report.discarded, vec!["0000001.rx".to_string()]);
        assert_eq!(rig.coordinator.stats().images_discarded, 1);
    }

    #[test]
    fn test_snap_warning_is_counted_once() {
        let rig = rig(|c| c.xdet_trig_count_offset = Some(100));
        let t = 1_700_000_000.0;
        rig.history("xdet_trig_count").record(t, Value::Int(101));
        rig.history("acquiring").record(t - 10.0, Value::Bool(true));
        rig.coordinator.set_layout(Some(Arc::new(DatasetLayout::new(&rig.data, "x", "rx"))));
        rig.image(1, t + 0.5);

        for _ in 0..3 {
            rig.coordinator.poll_once().unwrap();
        }
        // No acquisition events, so the image stays pending
        assert_eq!(rig.coordinator.stats().snap_warnings, 1);
        assert_eq!(rig.coordinator.stats().images_assigned, 0);
    }
}
