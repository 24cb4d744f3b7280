//! Grades page HTML to [`ProgressTable`].
//!
//! The portal renders discipline names and discipline rows in separate
//! regions, so rows are collected per `tbody` first and names are zipped
//! in by position afterwards. Any empty name aborts the whole snapshot.

use std::sync::OnceLock;

use scraper::{ElementRef, Html, Selector};

use crate::error::ExtractError;
use crate::models::{ControlEvent, Discipline, ProgressTable, ABSENT_GRADE};
use crate::report;

/// Row layouts that carry data: control-event rows and final-grade rows.
const EVENT_ROW_CELLS: usize = 4;
const FINAL_ROW_CELLS: usize = 2;

fn selector(cell: &'static OnceLock<Selector>, css: &str) -> &'static Selector {
    cell.get_or_init(|| Selector::parse(css).expect("static CSS selector is valid"))
}

fn grades_marker() -> &'static Selector {
    static CELL: OnceLock<Selector> = OnceLock::new();
    selector(&CELL, "div#div-Student_SemesterSheet__Mark")
}

fn tbody() -> &'static Selector {
    static CELL: OnceLock<Selector> = OnceLock::new();
    selector(&CELL, "tbody")
}

fn tr() -> &'static Selector {
    static CELL: OnceLock<Selector> = OnceLock::new();
    selector(&CELL, "tr")
}

fn td() -> &'static Selector {
    static CELL: OnceLock<Selector> = OnceLock::new();
    selector(&CELL, "td")
}

fn discipline_name() -> &'static Selector {
    static CELL: OnceLock<Selector> = OnceLock::new();
    selector(&CELL, ".my-2 div:first-child")
}

/// Whether `html` is the grades page rather than some other portal page.
pub fn is_grades_page(html: &str) -> bool {
    has_grades_marker(&Html::parse_document(html))
}

fn has_grades_marker(document: &Html) -> bool {
    document.select(grades_marker()).next().is_some()
}

pub fn extract(html: &str) -> Result<ProgressTable, ExtractError> {
    let document = Html::parse_document(html);
    if !has_grades_marker(&document) {
        return Err(ExtractError::NotGradesPage);
    }

    let mut disciplines = extract_disciplines_data(&document)?;
    let names = extract_discipline_names(&document)?;
    if names.len() != disciplines.len() {
        return Err(ExtractError::NameCountMismatch {
            names: names.len(),
            blocks: disciplines.len(),
        });
    }
    for (discipline, name) in disciplines.iter_mut().zip(names) {
        discipline.name = name;
    }

    let table = ProgressTable {
        user_id: 0,
        disciplines,
    };
    validate(&table)?;
    Ok(table)
}

fn extract_disciplines_data(document: &Html) -> Result<Vec<Discipline>, ExtractError> {
    let mut disciplines = Vec::new();

    for (block, body) in document.select(tbody()).enumerate() {
        let rows = body.select(tr()).filter(|row| {
            let cells = row.select(td()).count();
            cells == EVENT_ROW_CELLS || cells == FINAL_ROW_CELLS
        });

        let mut control_events = Vec::new();
        for (row_idx, row) in rows.enumerate() {
            let cells: Vec<ElementRef<'_>> = row.select(td()).collect();
            let name = normalize_ws(&cells[0].text().collect::<String>());
            if name.is_empty() {
                return Err(ExtractError::EmptyEventName {
                    block,
                    row: row_idx,
                });
            }

            let grade = normalize_ws(&cells[cells.len() - 1].text().collect::<String>());
            let grade = if grade.is_empty() {
                ABSENT_GRADE.to_string()
            } else {
                grade
            };

            control_events.push(ControlEvent { name, grade });
        }

        disciplines.push(Discipline {
            name: String::new(),
            control_events,
        });
    }

    Ok(disciplines)
}

/// Own text of each name element; nested elements carry unrelated labels.
fn extract_discipline_names(document: &Html) -> Result<Vec<String>, ExtractError> {
    document
        .select(discipline_name())
        .enumerate()
        .map(|(position, element)| {
            let own_text: String = element
                .children()
                .filter_map(|node| node.value().as_text())
                .map(|text| &**text)
                .collect();
            let name = normalize_ws(&own_text);
            if name.is_empty() {
                Err(ExtractError::EmptyDisciplineName(position))
            } else {
                Ok(name)
            }
        })
        .collect()
}

/// Encoding sanity check over the fully rendered table.
fn validate(table: &ProgressTable) -> Result<(), ExtractError> {
    let rendered = report::render_progress_table(table);
    let garbled = rendered
        .chars()
        .any(|c| c == char::REPLACEMENT_CHARACTER || (c.is_control() && c != '\n'));
    if garbled {
        return Err(ExtractError::InvalidText);
    }
    Ok(())
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
