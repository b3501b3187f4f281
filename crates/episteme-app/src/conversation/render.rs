// Text rendering for chat replies.

use episteme_core::{Participant, Resolution};

/// Format a probability as a percentage with at most two decimals
/// (`0.7` -> `70%`, `0.125` -> `12.5%`).
pub fn format_percent(probability: f64) -> String {
    let text = format!("{:.2}", probability * 100.0);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    format!("{text}%")
}

/// Format an error value, `N/A` when undefined.
pub fn format_error(error: Option<f64>) -> String {
    error.map_or_else(|| "N/A".to_string(), |e| format!("{e:.4}"))
}

/// A user's answers for a group: `question: percent` or `question: ?`.
pub fn overview(group: &str, entries: &[(String, Option<f64>)]) -> String {
    let mut out = format!("Your predictions for `{group}`:");
    for (question, probability) in entries {
        let value = probability.map_or_else(|| "?".to_string(), format_percent);
        out.push_str(&format!("\n- {question}: {value}"));
    }
    out
}

pub fn prediction_prompt(question: &str) -> String {
    format!("{question}\nHow likely is this? Answer with a percentage from 0 to 100.")
}

pub fn truth_prompt(question: &str) -> String {
    format!("{question}\nWhat was the outcome? Answer with true, false or unknown.")
}

/// Public results: ranking by error, then the questions the group as a
/// whole got wrong.
pub fn results(group: &str, resolution: &Resolution) -> String {
    let mut out = format!("Results for `{group}` (lower error is better):");
    for (idx, (participant, score)) in resolution.ranking().iter().enumerate() {
        let name = match participant {
            Participant::User(id) => id.clone(),
            Participant::Consensus => "consensus (group average)".to_string(),
        };
        out.push_str(&format!(
            "\n{}. {}: error {}, answered {}",
            idx + 1,
            name,
            format_error(score.error),
            format_percent(score.completion)
        ));
    }

    if resolution.flags.is_empty() {
        out.push_str("\nThe consensus landed on the right side of every question.");
    } else {
        out.push_str("\nQuestions the group got wrong:");
        for flag in &resolution.flags {
            out.push_str(&format!(
                "\n- {}: consensus {}, outcome {}",
                flag.question,
                format_percent(flag.consensus),
                flag.truth
            ));
        }
    }
    out
}

/// Active groups with their question counts.
pub fn group_list(summaries: &[(String, usize)]) -> String {
    if summaries.is_empty() {
        return "There are no open prediction groups.".to_string();
    }
    let mut out = "Open prediction groups:".to_string();
    for (name, count) in summaries {
        let noun = if *count == 1 { "question" } else { "questions" };
        out.push_str(&format!("\n- {name} ({count} {noun})"));
    }
    out
}

pub fn help(bot_name: &str, finish_keyword: &str, cancel_keyword: &str) -> String {
    format!(
        "In a channel, address me as `{bot_name}`:\n\
         - `{bot_name} predict <group>`: answer a group's questions in private\n\
         - `{bot_name} resolve <group>`: enter the outcomes and publish the scores\n\
         - `{bot_name} create <group>`: write a new group's questions in private\n\
         - `{bot_name} submit <group> <question>`: add a question to an open group\n\
         - `{bot_name} list`: show the open groups\n\
         In private:\n\
         - `update <group> <question> <percentage>`: change one prediction\n\
         - `status <group>`: show your predictions\n\
         While creating, send `{finish_keyword}` when done. \
         Send `{cancel_keyword}` to leave any session."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use episteme_core::scoring;
    use episteme_core::TruthValue;
    use std::collections::BTreeMap;

    #[test]
    fn percent_formatting() {
        assert_eq!(format_percent(0.7), "70%");
        assert_eq!(format_percent(0.125), "12.5%");
        assert_eq!(format_percent(0.0), "0%");
        assert_eq!(format_percent(1.0), "100%");
        assert_eq!(format_percent(1.0 / 3.0), "33.33%");
    }

    #[test]
    fn overview_marks_unanswered() {
        let text = overview(
            "G",
            &[("Q1".to_string(), Some(0.7)), ("Q2".to_string(), None)],
        );
        assert_eq!(text, "Your predictions for `G`:\n- Q1: 70%\n- Q2: ?");
    }

    #[test]
    fn results_list_ranking_and_flags() {
        let questions = vec!["Q1".to_string()];
        let predictions = BTreeMap::from([(
            "alice".to_string(),
            BTreeMap::from([("Q1".to_string(), 0.2)]),
        )]);
        let truths = BTreeMap::from([("Q1".to_string(), TruthValue::True)]);
        let resolution = scoring::score(&questions, &predictions, &truths);

        let text = results("G", &resolution);
        assert!(text.starts_with("Results for `G`"));
        assert!(text.contains("1. alice: error 0.6400, answered 100%"));
        assert!(text.contains("2. consensus (group average): error 0.6400"));
        assert!(text.contains("- Q1: consensus 20%, outcome true"));
    }

    #[test]
    fn results_show_na_last() {
        let questions = vec!["Q1".to_string()];
        let predictions = BTreeMap::from([(
            "bob".to_string(),
            BTreeMap::from([("Q1".to_string(), 0.5)]),
        )]);
        let truths = BTreeMap::from([("Q1".to_string(), TruthValue::Unknown)]);
        let text = results("G", &scoring::score(&questions, &predictions, &truths));
        assert!(text.contains("1. bob: error N/A"));
        assert!(text.contains("right side of every question"));
    }

    #[test]
    fn group_list_text() {
        assert_eq!(group_list(&[]), "There are no open prediction groups.");
        assert_eq!(
            group_list(&[("a".into(), 1), ("b".into(), 3)]),
            "Open prediction groups:\n- a (1 question)\n- b (3 questions)"
        );
    }
}
