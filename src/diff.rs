use crate::models::{GradeChange, ProgressTable, VOLATILE_EVENT_PREFIX};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TableDiff {
    pub changes: Vec<GradeChange>,
    /// Set when disciplines or control events no longer line up by position.
    /// `changes` then holds whatever was collected before the mismatch.
    pub structure_changed: bool,
}

impl TableDiff {
    /// True only when the comparison was complete and found nothing.
    pub fn is_unchanged(&self) -> bool {
        self.changes.is_empty() && !self.structure_changed
    }
}

pub fn diff(new: &ProgressTable, old: &ProgressTable) -> TableDiff {
    let mut result = TableDiff::default();

    if new.disciplines.len() != old.disciplines.len() {
        result.structure_changed = true;
        return result;
    }

    for (discipline, old_discipline) in new.disciplines.iter().zip(&old.disciplines) {
        if discipline.control_events.len() != old_discipline.control_events.len() {
            result.structure_changed = true;
            return result;
        }

        for (event, old_event) in discipline
            .control_events
            .iter()
            .zip(&old_discipline.control_events)
        {
            if event.name != old_event.name {
                result.structure_changed = true;
                return result;
            }

            if event.grade != old_event.grade && !event.name.starts_with(VOLATILE_EVENT_PREFIX) {
                result.changes.push(GradeChange {
                    user_id: new.user_id,
                    discipline: discipline.name.clone(),
                    control_event: event.name.clone(),
                    old_grade: old_event.grade.clone(),
                    new_grade: event.grade.clone(),
                });
            }
        }
    }

    result
}
