use colored::{ColoredString, Colorize};
use pullflow_core::DeployStatus;

/// 結果に応じて色付けした状態ラベル
pub fn status_label(status: DeployStatus) -> ColoredString {
    let label = format!("{:<12}", status.as_str());
    match status {
        DeployStatus::Built | DeployStatus::Ready => label.green(),
        DeployStatus::Error | DeployStatus::BuildFailed => label.red().bold(),
        DeployStatus::Waiting => label.yellow(),
        DeployStatus::Queued => label.dimmed(),
        DeployStatus::Cloning | DeployStatus::Building => label.cyan(),
    }
}

/// 複数行になりうるメッセージの 1 行目を `max` 文字で切り詰める
pub fn one_line(message: &str, max: usize) -> String {
    let line = message.lines().next().unwrap_or_default();
    if line.chars().count() <= max {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_line_truncates() {
        assert_eq!(one_line("short", 10), "short");
        assert_eq!(one_line("first\nsecond", 10), "first");
        assert_eq!(one_line("abcdefghijkl", 5), "abcd…");
        assert_eq!(one_line("", 5), "");
    }
}
