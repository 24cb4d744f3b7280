use std::fmt::Write;

use crate::models::{GradeChange, ProgressTable, RevocationCause};

pub const CREDENTIALS_EXPIRED: &str = "Данные для входа в БАРС устарели, отслеживание оценок остановлено. \
Авторизуйтесь заново, чтобы продолжить получать уведомления.";

pub const GRADES_PAGE_WRONG: &str = "Стартовая страница вашего аккаунта в БАРС не является страницей \
с оценками, отслеживание остановлено. Выберите страницу ведомости в настройках БАРС и авторизуйтесь заново.";

/// Markdown card for one grade change.
pub fn render_change(change: &GradeChange) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "*Получено изменение:*");
    let _ = writeln!(output);
    let _ = writeln!(output, "*Название дисциплины:*");
    let _ = writeln!(output, "{}", change.discipline);
    let _ = writeln!(output);
    let _ = writeln!(output, "*Контрольное мероприятие:*");
    let _ = writeln!(output, "{}", change.control_event);
    let _ = writeln!(output);
    let _ = writeln!(output, "*Старая оценка:*");
    let _ = writeln!(output, "{}", change.old_grade);
    let _ = writeln!(output);
    let _ = writeln!(output, "*Новая оценка:*");
    let _ = write!(output, "{}", change.new_grade);

    output
}

pub fn render_progress_table(table: &ProgressTable) -> String {
    let mut output = String::new();

    if table.is_unknown() {
        let _ = writeln!(output, "Таблица успеваемости ещё не получена.");
        return output;
    }

    for discipline in &table.disciplines {
        let _ = writeln!(output, "*Название дисциплины:*");
        let _ = writeln!(output, "{}", discipline.name);
        let _ = writeln!(output);
        for event in &discipline.control_events {
            let _ = writeln!(output, "{}", event.name);
            let _ = writeln!(output, "*Оценка:* {}", event.grade);
            let _ = writeln!(output);
        }
    }

    output
}

pub fn revocation_notice(cause: RevocationCause) -> Option<&'static str> {
    match cause {
        RevocationCause::CredentialsExpired => Some(CREDENTIALS_EXPIRED),
        RevocationCause::WrongGradesPage => Some(GRADES_PAGE_WRONG),
        RevocationCause::Unreachable => None,
    }
}
