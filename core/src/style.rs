use std::collections::BTreeMap;

use colored::{Color, ColoredString, Colorize};
use crossterm::terminal;

use crate::testing::{utf8text, CaseId, JudgeCode, RunRecord, Verdict};

#[macro_export]
macro_rules! print_success {
    ($fmt:literal, $($e:tt)*) => {
        $crate::style::print_success_line(&format!($fmt, $($e)*))
    }
}

pub fn print_success_line(msg: &str) {
    println!("{}", msg.green());
}

pub fn is_truecolor_supported() -> bool {
    let Ok(v) = std::env::var("COLORTERM") else {
        return false
    };
    matches!(v.as_str(), "truecolor" | "24bit")
}

pub trait ColorTheme {
    fn color(&self) -> Color;
}

impl ColorTheme for JudgeCode {
    fn color(&self) -> Color {
        use JudgeCode::*;
        match self {
            AC => Color::Green,
            OLE | MLE | IR | RTE | WA => Color::Yellow,
            TLE | WTLE => Color::White,
        }
    }
}

/// Code for a status line: colored, bold unless accepted, padded to 3 columns.
pub fn judge_label(judge: JudgeCode) -> ColoredString {
    let code: &'static str = judge.into();
    let s = format!("{:3}", code).color(judge.color());
    if judge.is_accepted() {
        s
    } else {
        s.bold()
    }
}

pub fn judge_icon(judge: JudgeCode) -> ColoredString {
    let fg = if is_truecolor_supported() {
        Color::TrueColor {
            r: 255,
            g: 255,
            b: 255,
        }
    } else {
        Color::BrightBlack
    };
    format!(" {} ", judge)
        .on_color(judge.color())
        .bold()
        .color(fg)
}

pub fn print_problem_header(problem_id: &str) {
    println!("Validating problem {}...", problem_id.cyan().bold());
}

pub fn print_skipped(reason: impl std::fmt::Display) {
    println!("\t{} - {}", "Skipped".magenta().bold(), reason);
}

pub fn print_batch_header(batch_number: u32) {
    println!("{}", format!("Batch #{}", batch_number).yellow().bold());
}

/// Status line of one case, e.g. `  Test case  3 IR  (n must not be 3)`.
///
/// Cases inside a batch are indented under the batch header.
pub fn case_line(id: &CaseId, verdict: &Verdict) -> String {
    let padding = if id.batch_number.is_some() { "  " } else { "" };
    let mut line = format!(
        "{}Test case {:2} {}",
        padding,
        id.number,
        judge_label(verdict.code())
    );
    if !verdict.feedback.is_empty() {
        line += &format!(" ({})", verdict.feedback.underline());
    }
    line
}

pub fn print_case_line(id: &CaseId, verdict: &Verdict) {
    println!("{}", case_line(id, verdict));
}

pub fn print_compile_failure(message: &str) {
    println!("{}", "Failed compiling validator!".red().bold());
    println!("{}", message.trim_end());
}

pub fn print_problem_error(message: &str) {
    println!("{}", message.red().bold());
}

pub fn print_problem_result(problem_id: &str, failed: bool) {
    if failed {
        println!("Problem {} {}.", problem_id.cyan().bold(), "failed".red().bold());
    } else {
        println!(
            "Problem {} passed with flying colours.",
            problem_id.cyan().bold()
        );
    }
    println!();
}

pub fn print_validation_summary(total_fails: usize) {
    println!();
    println!("Test complete.");
    if total_fails > 0 {
        let msg = format!("A total of {} problem(s) have invalid input", total_fails);
        println!("{}", msg.red().bold());
    } else {
        println!("{}", "All problems validated.".green().bold());
    }
}

/// One line tally of a `check` run, e.g. `----- 2/5 tests failed ( WA x2) -----`.
pub fn print_check_summary(record: &RunRecord) {
    let bar = "-".repeat(5);
    print!("{} ", bar);

    let count = record
        .codes()
        .into_iter()
        .fold(BTreeMap::<JudgeCode, usize>::new(), |mut count, c| {
            *count.entry(c).or_default() += 1;
            count
        });

    let num_total = record.len();
    let num_passed = count.get(&JudgeCode::AC).copied().unwrap_or(0);

    if num_passed == num_total {
        print!("{}", format!("All {} tests passed", num_total).green());
    } else {
        let detail = count
            .iter()
            .filter(|(judge, _)| !judge.is_accepted())
            .map(|(&judge, &cnt)| {
                format!(
                    "{}{}{}",
                    judge_icon(judge),
                    "x".dimmed(),
                    cnt.to_string().bold().bright_white()
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let summary = format!("{}/{} tests failed", num_total - num_passed, num_total);
        print!("{} ({})", summary.bright_red(), detail);
    }
    println!(" {}", bar);
}

/// Expected and actual output of a wrong answer, framed to the terminal width.
pub fn print_wrong_answer_detail(
    id: &CaseId,
    verdict: &Verdict,
    expected: &[u8],
    actual: &[u8],
) {
    const BOLD_LINE: &str = "━";
    const THIN_LINE: &str = "─";

    let (cols, _) = terminal::size().unwrap_or((40, 40));
    let cols = cols as usize;
    let bold_bar = BOLD_LINE.repeat(cols).blue().bold();

    let elapsed = verdict
        .usage
        .map(|u| format!(" [{}ms]", u.wall_time.as_millis()))
        .unwrap_or_default();
    println!(
        "\n{}: {}{}\n{}",
        format!("Test case {}", id.number).bright_yellow().bold(),
        judge_icon(verdict.code()),
        elapsed,
        bold_bar,
    );

    let print_sub_title = |s: &str| {
        println!(
            "{}{}",
            s.cyan().bold(),
            THIN_LINE.repeat(cols.saturating_sub(s.len() + 1)).bright_black(),
        )
    };
    let print_body = |bytes: &[u8]| {
        let text = utf8text(bytes);
        if text.is_empty() {
            println!("{}", "<EMPTY>".magenta().dimmed());
        } else {
            println!("{}", text);
        }
        if !bytes.is_empty() && !bytes.ends_with(b"\n") {
            println!("{}", " Missing new line ".on_yellow().black().bold());
        }
    };

    print_sub_title("[expected]");
    print_body(expected);
    print_sub_title("[stdout]");
    print_body(actual);
    println!("{}", bold_bar);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::ResultFlags;

    fn verdict(codes: &[JudgeCode], feedback: &str) -> Verdict {
        let flags: ResultFlags = codes.iter().copied().collect();
        Verdict::from_flags(flags, feedback, 1.0, None)
    }

    #[test]
    fn case_lines() {
        colored::control::set_override(false);

        let unbatched = CaseId {
            number: 3,
            batch_number: None,
            position: 3,
        };
        let batched = CaseId {
            number: 12,
            batch_number: Some(2),
            position: 1,
        };

        assert_eq!(case_line(&unbatched, &verdict(&[], "")), "Test case  3 AC ");
        assert_eq!(
            case_line(&unbatched, &verdict(&[JudgeCode::IR], "n must not be 3")),
            "Test case  3 IR  (n must not be 3)"
        );
        assert_eq!(
            case_line(&batched, &verdict(&[JudgeCode::TLE], "")),
            "  Test case 12 TLE"
        );
        assert_eq!(
            case_line(&batched, &verdict(&[], "ok")),
            "  Test case 12 AC  (ok)"
        );
    }
}
