//! The workout entity.

use crate::error::{CoreError, CoreResult};
use crate::types::{Timestamp, WorkoutId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single logged workout session.
///
/// `revision` and `updated_at` are maintained by the repository and the
/// sync engine; callers fill in the session content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutRecord {
    /// Stable identifier, immutable after creation.
    pub id: WorkoutId,
    /// When the session started.
    pub start_time: Timestamp,
    /// When the session ended. Never before `start_time`.
    pub end_time: Timestamp,
    /// Exercises performed, in order.
    pub exercise_entries: Vec<ExerciseEntry>,
    /// Perceived intensity.
    pub intensity: Option<Intensity>,
    /// Estimated energy expenditure.
    pub calories_burned: Option<u32>,
    /// Free-form notes.
    pub notes: Option<String>,
    /// Mood before the session.
    pub mood_before: Option<Mood>,
    /// Mood after the session.
    pub mood_after: Option<Mood>,
    /// Energy before the session.
    pub energy_before: Option<EnergyLevel>,
    /// Energy after the session.
    pub energy_after: Option<EnergyLevel>,
    /// Per-record version counter. Never decreases.
    pub revision: u64,
    /// Time of the last change, used for last-writer-wins.
    pub updated_at: Timestamp,
    /// Tombstone flag.
    pub deleted: bool,
}

impl WorkoutRecord {
    /// Creates a session with a fresh id and no exercises.
    #[must_use]
    pub fn new(start_time: Timestamp, end_time: Timestamp) -> Self {
        Self::with_id(WorkoutId::new(), start_time, end_time)
    }

    /// Creates a session with a caller-chosen id.
    #[must_use]
    pub fn with_id(id: WorkoutId, start_time: Timestamp, end_time: Timestamp) -> Self {
        Self {
            id,
            start_time,
            end_time,
            exercise_entries: Vec::new(),
            intensity: None,
            calories_burned: None,
            notes: None,
            mood_before: None,
            mood_after: None,
            energy_before: None,
            energy_after: None,
            revision: 0,
            updated_at: Timestamp::EPOCH,
            deleted: false,
        }
    }

    /// Appends an exercise.
    #[must_use]
    pub fn exercise(mut self, entry: ExerciseEntry) -> Self {
        self.exercise_entries.push(entry);
        self
    }

    /// Sets the intensity.
    #[must_use]
    pub fn intensity(mut self, intensity: Intensity) -> Self {
        self.intensity = Some(intensity);
        self
    }

    /// Sets the calories burned.
    #[must_use]
    pub fn calories(mut self, calories: u32) -> Self {
        self.calories_burned = Some(calories);
        self
    }

    /// Sets the notes.
    #[must_use]
    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Sets mood before and after.
    #[must_use]
    pub fn mood(mut self, before: Mood, after: Mood) -> Self {
        self.mood_before = Some(before);
        self.mood_after = Some(after);
        self
    }

    /// Sets energy before and after.
    #[must_use]
    pub fn energy(mut self, before: EnergyLevel, after: EnergyLevel) -> Self {
        self.energy_before = Some(before);
        self.energy_after = Some(after);
        self
    }

    /// Session length.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end_time.duration_since(self.start_time)
    }

    /// True if the session content (everything except sync metadata)
    /// matches `other`.
    #[must_use]
    pub fn same_content(&self, other: &WorkoutRecord) -> bool {
        self.id == other.id
            && self.start_time == other.start_time
            && self.end_time == other.end_time
            && self.exercise_entries == other.exercise_entries
            && self.intensity == other.intensity
            && self.calories_burned == other.calories_burned
            && self.notes == other.notes
            && self.mood_before == other.mood_before
            && self.mood_after == other.mood_after
            && self.energy_before == other.energy_before
            && self.energy_after == other.energy_after
            && self.deleted == other.deleted
    }

    /// Checks the caller-supplied fields.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidArgument`] if the session ends before it
    /// starts or an exercise has no name.
    pub fn validate(&self) -> CoreResult<()> {
        if self.end_time < self.start_time {
            return Err(CoreError::invalid_argument(format!(
                "workout {} ends ({}) before it starts ({})",
                self.id, self.end_time, self.start_time
            )));
        }
        if let Some(pos) = self
            .exercise_entries
            .iter()
            .position(|e| e.name.trim().is_empty())
        {
            return Err(CoreError::invalid_argument(format!(
                "exercise #{pos} of workout {} has an empty name",
                self.id
            )));
        }
        Ok(())
    }
}

/// One exercise within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseEntry {
    /// Exercise name, e.g. "Deadlift".
    pub name: String,
    /// Broad category.
    pub category: ExerciseCategory,
    /// Targeted muscle groups.
    pub muscle_groups: Vec<MuscleGroup>,
    /// Sets performed, in order.
    pub sets: Vec<ExerciseSet>,
}

impl ExerciseEntry {
    /// Creates an entry with no sets.
    #[must_use]
    pub fn new(name: impl Into<String>, category: ExerciseCategory) -> Self {
        Self {
            name: name.into(),
            category,
            muscle_groups: Vec::new(),
            sets: Vec::new(),
        }
    }

    /// Adds a targeted muscle group.
    #[must_use]
    pub fn targets(mut self, group: MuscleGroup) -> Self {
        self.muscle_groups.push(group);
        self
    }

    /// Appends a set.
    #[must_use]
    pub fn set(mut self, set: ExerciseSet) -> Self {
        self.sets.push(set);
        self
    }
}

/// One set of an exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseSet {
    /// Repetitions.
    pub reps: Option<u32>,
    /// Load in grams.
    pub weight_grams: Option<u32>,
    /// Time under work, in seconds.
    pub duration_secs: Option<u32>,
}

impl ExerciseSet {
    /// A weighted set.
    #[must_use]
    pub const fn weighted(reps: u32, weight_grams: u32) -> Self {
        Self {
            reps: Some(reps),
            weight_grams: Some(weight_grams),
            duration_secs: None,
        }
    }

    /// A timed set.
    #[must_use]
    pub const fn timed(duration_secs: u32) -> Self {
        Self {
            reps: None,
            weight_grams: None,
            duration_secs: Some(duration_secs),
        }
    }
}

/// Exercise category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExerciseCategory {
    /// Resistance training.
    Strength,
    /// Endurance work.
    Cardio,
    /// Mobility and stretching.
    Flexibility,
    /// Stability work.
    Balance,
    /// Games and sports.
    Sports,
}

/// Muscle group targeted by an exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum MuscleGroup {
    Chest,
    Back,
    Shoulders,
    Biceps,
    Triceps,
    Forearms,
    Abs,
    Glutes,
    Quads,
    Hamstrings,
    Calves,
    FullBody,
}

/// Perceived intensity of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Intensity {
    Light,
    Moderate,
    Intense,
}

/// Self-reported mood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Mood {
    Terrible,
    Bad,
    Okay,
    Good,
    Excellent,
}

/// Self-reported energy level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum EnergyLevel {
    VeryLow,
    Low,
    Moderate,
    High,
    VeryHigh,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn squat_session() -> WorkoutRecord {
        WorkoutRecord::new(Timestamp::from_millis(1_000), Timestamp::from_millis(61_000))
            .exercise(
                ExerciseEntry::new("Back squat", ExerciseCategory::Strength)
                    .targets(MuscleGroup::Quads)
                    .targets(MuscleGroup::Glutes)
                    .set(ExerciseSet::weighted(5, 100_000)),
            )
            .intensity(Intensity::Intense)
    }

    #[test]
    fn validate_accepts_well_formed() {
        let session = squat_session();
        assert!(session.validate().is_ok());
        assert_eq!(session.duration(), Duration::from_secs(60));
    }

    #[test]
    fn validate_rejects_reversed_times() {
        let mut session = squat_session();
        session.end_time = Timestamp::from_millis(0);
        assert!(matches!(
            session.validate(),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn validate_rejects_blank_exercise_name() {
        let session = squat_session().exercise(ExerciseEntry::new("  ", ExerciseCategory::Cardio));
        let err = session.validate().unwrap_err();
        assert!(err.to_string().contains("exercise #1"));
    }

    #[test]
    fn same_content_ignores_sync_metadata() {
        let a = squat_session();
        let mut b = a.clone();
        b.revision = 9;
        b.updated_at = Timestamp::from_millis(99);
        assert!(a.same_content(&b));

        b.notes = Some("felt heavy".into());
        assert!(!a.same_content(&b));
    }
}
