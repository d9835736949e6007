//! Fixed log phrases the Agent prints at the end of a run.
//!
//! The Agent is a closed box; these literal substrings are the only terminal
//! signals it gives. They are matched verbatim against the run's log window.

use crate::model::Phase;

/// Printed once the whole task list finished.
pub const SUCCESS: &str = "任务已全部完成！";

/// Failure phrases for every phase, with a short reason for reports.
const COMMON_FAILURES: &[(&str, &str)] = &[
    ("任务出错: StartUp", "agent failed to log in"),
    ("任务出错: 开始唤醒", "agent failed to log in"),
    (
        "请 ｢检查连接设置｣ → ｢尝试重启模拟器与 ADB｣ → ｢重启电脑｣",
        "ADB connection error",
    ),
    (
        "请「检查连接设置」或「尝试重启模拟器与 ADB」或「重启电脑」",
        "ADB connection error",
    ),
    (
        "请检查连接设置或尝试重启模拟器与 ADB 或重启电脑",
        "ADB connection error",
    ),
    ("未检测到任何模拟器", "no emulator detected"),
    ("已停止", "agent stopped before finishing"),
    ("MaaAssistantArknights GUI exited", "agent exited before finishing"),
];

/// Routine only: the combat stage could not be fought.
const ROUTINE_FAILURES: &[(&str, &str)] = &[("任务出错: Fight", "combat task failed")];

/// Printed when this week's annihilation rewards are already capped.
pub const ANNIHILATION_CAPPED: &str = "剿灭任务失败";

/// Verdict for one snapshot of the log window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogVerdict {
    Running,
    Succeeded,
    Failed { reason: &'static str },
}

/// Classify the window. Success wins over failure phrases so a run that
/// recovered from a transient error and then finished still counts.
pub fn classify<S: AsRef<str>>(lines: &[S], phase: Phase) -> LogVerdict {
    if lines.iter().any(|l| l.as_ref().contains(SUCCESS)) {
        return LogVerdict::Succeeded;
    }

    let phase_failures: &[(&'static str, &'static str)] = match phase {
        Phase::Routine => ROUTINE_FAILURES,
        Phase::Bootstrap | Phase::Annihilation => &[],
    };
    for &(needle, reason) in phase_failures.iter().chain(COMMON_FAILURES) {
        if lines.iter().any(|l| l.as_ref().contains(needle)) {
            return LogVerdict::Failed { reason };
        }
    }
    LogVerdict::Running
}

/// Whether the window reports the weekly annihilation cap.
pub fn annihilation_capped<S: AsRef<str>>(lines: &[S]) -> bool {
    lines.iter().any(|l| l.as_ref().contains(ANNIHILATION_CAPPED))
}
