//! Test fixtures and store helpers.
//!
//! Provides stores that run on a [`ManualClock`] and can be reopened from
//! the same bytes, plus a few realistic sessions.

use crate::crash::{CrashSwitch, CrashableBackend};
use fitsync_core::{
    Config, Database, EnergyLevel, ExerciseCategory, ExerciseEntry, ExerciseSet, Intensity,
    ManualClock, Mood, MuscleGroup, RetryPolicy, Timestamp, WorkoutRecord,
};
use fitsync_storage::InMemoryBackend;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// 2024-03-01T08:00:00Z, the default start of fixture clocks.
pub const FIXTURE_EPOCH: Timestamp = Timestamp::from_millis(1_709_280_000_000);

/// A test store with a controllable clock.
///
/// In-memory fixtures keep a handle on the journal bytes, so the store can
/// be reopened after a (simulated) crash exactly as it was left.
pub struct TestStore {
    /// The database instance.
    pub db: Database,
    /// Clock shared by every database opened from this fixture.
    pub clock: ManualClock,
    /// Configuration used to open (and reopen) the database.
    pub config: Config,
    memory: Option<InMemoryBackend>,
    temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates an in-memory store with a fast, jitter-free retry policy.
    pub fn memory() -> Self {
        Self::memory_with_config(default_test_config())
    }

    /// Creates an in-memory store with the given configuration.
    pub fn memory_with_config(config: Config) -> Self {
        let memory = InMemoryBackend::new();
        let clock = ManualClock::new(FIXTURE_EPOCH);
        let db = Database::open_with_backend(
            Box::new(memory.clone()),
            config.clone(),
            Arc::new(clock.clone()),
        )
        .expect("Failed to open in-memory store");
        Self {
            db,
            clock,
            config,
            memory: Some(memory),
            temp_dir: None,
        }
    }

    /// Creates an in-memory store whose writes go through a
    /// [`CrashableBackend`]; returns the switch that arms it.
    pub fn crashable() -> (Self, CrashSwitch) {
        let memory = InMemoryBackend::new();
        let backend = CrashableBackend::new(Box::new(memory.clone()));
        let switch = backend.switch();
        let clock = ManualClock::new(FIXTURE_EPOCH);
        let config = default_test_config();
        let db = Database::open_with_backend(
            Box::new(backend),
            config.clone(),
            Arc::new(clock.clone()),
        )
        .expect("Failed to open crashable store");
        (
            Self {
                db,
                clock,
                config,
                memory: Some(memory),
                temp_dir: None,
            },
            switch,
        )
    }

    /// Creates a store in a journal file inside a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = default_test_config();
        let clock = ManualClock::new(FIXTURE_EPOCH);
        let db = open_file(&temp_dir.path().join("workouts.fjnl"), &config, &clock);
        Self {
            db,
            clock,
            config,
            memory: None,
            temp_dir: Some(temp_dir),
        }
    }

    /// Journal file path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir
            .as_ref()
            .map(|d| d.path().join("workouts.fjnl"))
    }

    /// Opens a second database over the bytes this fixture has written so
    /// far, as a restarted process would. The current handle stays usable
    /// but the two no longer share state.
    pub fn reopen(&self) -> Database {
        match (&self.memory, self.path()) {
            (Some(memory), _) => {
                let bytes = InMemoryBackend::with_data(memory.data());
                Database::open_with_backend(
                    Box::new(bytes),
                    self.config.clone(),
                    Arc::new(self.clock.clone()),
                )
                .expect("Failed to reopen store")
            }
            (None, Some(path)) => open_file(&path, &self.config, &self.clock),
            (None, None) => unreachable!("fixture has neither memory nor a path"),
        }
    }

    /// Replaces the fixture's database with a reopened one.
    pub fn restart(&mut self) {
        self.db = self.reopen();
    }
}

impl std::ops::Deref for TestStore {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

fn open_file(path: &std::path::Path, config: &Config, clock: &ManualClock) -> Database {
    let backend = fitsync_storage::FileBackend::open_with_create_dirs(path)
        .expect("Failed to create journal file");
    Database::open_with_backend(Box::new(backend), config.clone(), Arc::new(clock.clone()))
        .expect("Failed to open file store")
}

/// Configuration used by fixtures: 3 attempts, 1s initial backoff, no jitter.
pub fn default_test_config() -> Config {
    Config::default().retry(
        RetryPolicy::new(3)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(60))
            .with_jitter(0.0),
    )
}

/// Runs a test with a temporary in-memory store.
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&TestStore) -> R,
{
    let store = TestStore::memory();
    f(&store)
}

/// Sample sessions.
pub mod sessions {
    use super::*;

    /// A 45 minute strength session starting `offset` after
    /// [`FIXTURE_EPOCH`].
    pub fn strength(offset: Duration) -> WorkoutRecord {
        let start = FIXTURE_EPOCH.saturating_add(offset);
        WorkoutRecord::new(start, start.saturating_add(Duration::from_secs(45 * 60)))
            .exercise(
                ExerciseEntry::new("Deadlift", ExerciseCategory::Strength)
                    .targets(MuscleGroup::Back)
                    .targets(MuscleGroup::Hamstrings)
                    .set(ExerciseSet::weighted(5, 140_000))
                    .set(ExerciseSet::weighted(5, 140_000))
                    .set(ExerciseSet::weighted(3, 150_000)),
            )
            .exercise(
                ExerciseEntry::new("Overhead press", ExerciseCategory::Strength)
                    .targets(MuscleGroup::Shoulders)
                    .set(ExerciseSet::weighted(8, 45_000)),
            )
            .intensity(Intensity::Intense)
            .calories(380)
            .mood(Mood::Okay, Mood::Good)
            .energy(EnergyLevel::Moderate, EnergyLevel::High)
    }

    /// A 30 minute run starting `offset` after [`FIXTURE_EPOCH`].
    pub fn run(offset: Duration) -> WorkoutRecord {
        let start = FIXTURE_EPOCH.saturating_add(offset);
        WorkoutRecord::new(start, start.saturating_add(Duration::from_secs(30 * 60)))
            .exercise(
                ExerciseEntry::new("Easy run", ExerciseCategory::Cardio)
                    .targets(MuscleGroup::FullBody)
                    .set(ExerciseSet::timed(1_800)),
            )
            .intensity(Intensity::Moderate)
            .calories(310)
            .notes("5k along the river")
    }
}
