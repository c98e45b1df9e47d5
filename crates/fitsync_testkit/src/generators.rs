//! Property-based test generators using proptest.
//!
//! Generated records always pass [`WorkoutRecord::validate`].

use fitsync_core::{
    EnergyLevel, ExerciseCategory, ExerciseEntry, ExerciseSet, Intensity, Mood, MuscleGroup,
    Timestamp, WorkoutId, WorkoutRecord,
};
use proptest::prelude::*;

/// Strategy for generating workout ids.
pub fn workout_id_strategy() -> impl Strategy<Value = WorkoutId> {
    prop::array::uniform16(any::<u8>()).prop_map(WorkoutId::from_bytes)
}

/// Strategy for timestamps within a few years of 2024.
pub fn timestamp_strategy() -> impl Strategy<Value = Timestamp> {
    (1_700_000_000_000i64..1_800_000_000_000).prop_map(Timestamp::from_millis)
}

fn category_strategy() -> impl Strategy<Value = ExerciseCategory> {
    prop_oneof![
        Just(ExerciseCategory::Strength),
        Just(ExerciseCategory::Cardio),
        Just(ExerciseCategory::Flexibility),
        Just(ExerciseCategory::Balance),
        Just(ExerciseCategory::Sports),
    ]
}

fn muscle_group_strategy() -> impl Strategy<Value = MuscleGroup> {
    prop_oneof![
        Just(MuscleGroup::Chest),
        Just(MuscleGroup::Back),
        Just(MuscleGroup::Shoulders),
        Just(MuscleGroup::Biceps),
        Just(MuscleGroup::Triceps),
        Just(MuscleGroup::Abs),
        Just(MuscleGroup::Glutes),
        Just(MuscleGroup::Quads),
        Just(MuscleGroup::Hamstrings),
        Just(MuscleGroup::FullBody),
    ]
}

fn set_strategy() -> impl Strategy<Value = ExerciseSet> {
    prop_oneof![
        (1u32..30, 0u32..300_000).prop_map(|(reps, grams)| ExerciseSet::weighted(reps, grams)),
        (10u32..7_200).prop_map(ExerciseSet::timed),
    ]
}

/// Strategy for generating exercise entries with a non-blank name.
pub fn exercise_entry_strategy() -> impl Strategy<Value = ExerciseEntry> {
    (
        prop::string::string_regex("[A-Z][a-z]{2,15}( [a-z]{2,10})?").expect("Invalid regex"),
        category_strategy(),
        prop::collection::vec(muscle_group_strategy(), 0..3),
        prop::collection::vec(set_strategy(), 1..6),
    )
        .prop_map(|(name, category, muscle_groups, sets)| ExerciseEntry {
            name,
            category,
            muscle_groups,
            sets,
        })
}

fn mood_strategy() -> impl Strategy<Value = Mood> {
    prop_oneof![
        Just(Mood::Terrible),
        Just(Mood::Bad),
        Just(Mood::Okay),
        Just(Mood::Good),
        Just(Mood::Excellent),
    ]
}

fn energy_strategy() -> impl Strategy<Value = EnergyLevel> {
    prop_oneof![
        Just(EnergyLevel::VeryLow),
        Just(EnergyLevel::Low),
        Just(EnergyLevel::Moderate),
        Just(EnergyLevel::High),
        Just(EnergyLevel::VeryHigh),
    ]
}

/// Strategy for generating valid, live workout records.
///
/// `revision` is 0 and `updated_at` the epoch, as for a record the caller
/// has not saved yet.
pub fn workout_strategy() -> impl Strategy<Value = WorkoutRecord> {
    (
        workout_id_strategy(),
        timestamp_strategy(),
        0u64..3 * 3_600_000,
        prop::collection::vec(exercise_entry_strategy(), 0..4),
        prop::option::of(prop_oneof![
            Just(Intensity::Light),
            Just(Intensity::Moderate),
            Just(Intensity::Intense)
        ]),
        prop::option::of(0u32..2_000),
        prop::option::of("[a-z ]{0,40}"),
        prop::option::of((mood_strategy(), mood_strategy())),
        prop::option::of((energy_strategy(), energy_strategy())),
    )
        .prop_map(
            |(id, start, length, entries, intensity, calories, notes, mood, energy)| {
                let end = Timestamp::from_millis(start.as_millis() + length as i64);
                let mut record = WorkoutRecord::with_id(id, start, end);
                record.exercise_entries = entries;
                record.intensity = intensity;
                record.calories_burned = calories;
                record.notes = notes;
                record.mood_before = mood.map(|m| m.0);
                record.mood_after = mood.map(|m| m.1);
                record.energy_before = energy.map(|e| e.0);
                record.energy_after = energy.map(|e| e.1);
                record
            },
        )
}

/// One step of a random local/remote edit history for a single record.
#[derive(Debug, Clone)]
pub enum EditStep {
    /// A local edit (new calories value).
    LocalEdit {
        /// New calories value.
        calories: u32,
    },
    /// The clock moves forward.
    Tick {
        /// Milliseconds to advance.
        millis: u64,
    },
    /// A version arrives from the remote.
    RemoteVersion {
        /// Revision the remote reports.
        revision: u64,
        /// Offset of the remote `updated_at` from the current time.
        skew_millis: i64,
        /// New calories value.
        calories: u32,
    },
    /// Pending changes are pushed.
    Push,
}

/// Strategy for generating edit steps.
pub fn edit_step_strategy() -> impl Strategy<Value = EditStep> {
    prop_oneof![
        3 => (0u32..2_000).prop_map(|calories| EditStep::LocalEdit { calories }),
        2 => (1u64..120_000).prop_map(|millis| EditStep::Tick { millis }),
        2 => (0u64..20, -60_000i64..60_000, 0u32..2_000).prop_map(
            |(revision, skew_millis, calories)| EditStep::RemoteVersion {
                revision,
                skew_millis,
                calories,
            }
        ),
        1 => Just(EditStep::Push),
    ]
}

/// Strategy for generating a sequence of edit steps.
pub fn edit_sequence_strategy(
    min_steps: usize,
    max_steps: usize,
) -> impl Strategy<Value = Vec<EditStep>> {
    prop::collection::vec(edit_step_strategy(), min_steps..max_steps)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn generated_workouts_validate(record in workout_strategy()) {
            prop_assert!(record.validate().is_ok());
            prop_assert!(!record.deleted);
            prop_assert!(record.end_time >= record.start_time);
        }

        #[test]
        fn generated_names_are_not_blank(entry in exercise_entry_strategy()) {
            prop_assert!(!entry.name.trim().is_empty());
            prop_assert!(!entry.sets.is_empty());
        }
    }
}
