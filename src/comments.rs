#[allow(unused_imports)]
use log::{debug, trace};

use crate::model::PrComment;

// Bots whose feedback is worth feeding back to a developer by default.
// Anything else matching the bot heuristic gets dropped, otherwise every
// CI status comment would trigger a feedback round.
pub const DEFAULT_ALLOWED_BOTS: &[&str] = &[
    "sonarcloud[bot]",
    "coderabbitai[bot]",
    "codecov[bot]",
    "github-actions[bot]",
];

// Bot authors that don't advertise themselves with a [bot] suffix or a "bot"
// substring. Purely name-based, like the rest of the detection.
const KNOWN_BOT_NAMES: &[&str] = &["renovate", "snyk", "mergify", "greenkeeper"];

#[derive(Debug, Clone)]
pub struct FilterOptions {
    // Drop the PR author's own comments. On our PRs the author is one of our
    // developers, so its comments are replies, not feedback.
    pub exclude_author: bool,
    pub allowed_bots: Vec<String>,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            exclude_author: true,
            allowed_bots: DEFAULT_ALLOWED_BOTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

// Heuristic, name-only bot detection. False positives are acceptable here: a
// human called "robotina" just needs to be added to allowed_bots.
pub fn looks_like_bot(author: &str) -> bool {
    let lower = author.to_lowercase();
    lower.ends_with("[bot]")
        || lower.contains("bot")
        || KNOWN_BOT_NAMES.iter().any(|name| lower == *name)
}

// A comment survives iff it isn't the PR author talking to themselves
// (when exclude_author) and, if the author looks like a bot, that bot is on
// the allowlist.
pub fn filter_comments(
    comments: Vec<PrComment>,
    pr_author: &str,
    options: &FilterOptions,
) -> Vec<PrComment> {
    comments
        .into_iter()
        .filter(|comment| {
            if options.exclude_author && comment.author == pr_author {
                trace!("dropping comment {} by PR author", comment.id);
                return false;
            }
            if looks_like_bot(&comment.author)
                && !options.allowed_bots.iter().any(|b| b == &comment.author)
            {
                debug!(
                    "dropping comment {} by unlisted bot {:?}",
                    comment.id, comment.author
                );
                return false;
            }
            true
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use test_case::test_case;

    use super::*;
    use crate::model::test_utils::comment;

    #[test_case("sonarcloud[bot]", true)]
    #[test_case("dependabot", true)]
    #[test_case("renovate", true)]
    #[test_case("RoBoTina", true; "substring match is case insensitive")]
    #[test_case("alice", false)]
    #[test_case("ai-dev", false)]
    fn test_looks_like_bot(author: &str, want: bool) {
        assert_that!(looks_like_bot(author), eq(want));
    }

    // Scenario from the integration playbook: allowlisted bot survives,
    // unlisted bot doesn't, the PR author's own reply doesn't.
    #[googletest::test]
    fn test_filter_allowlist_and_author() {
        let comments = vec![
            comment("c1", "sonarcloud[bot]", "coverage dropped"),
            comment("c2", "random[bot]", "beep"),
            comment("c3", "ai-dev", "thanks, fixed"),
            comment("c4", "alice", "please rename this"),
        ];
        let filtered = filter_comments(comments, "ai-dev", &FilterOptions::default());
        let ids: Vec<&str> = filtered.iter().map(|c| c.id.as_str()).collect();
        assert_that!(ids, eq(&vec!["c1", "c4"]));
    }

    #[googletest::test]
    fn test_filter_keeps_author_when_not_excluding() {
        let comments = vec![comment("c1", "ai-dev", "self reply")];
        let options = FilterOptions {
            exclude_author: false,
            ..Default::default()
        };
        let filtered = filter_comments(comments, "ai-dev", &options);
        assert_that!(filtered, len(eq(1)));
    }

    #[googletest::test]
    fn test_filter_empty_allowlist_drops_all_bots() {
        let comments = vec![
            comment("c1", "sonarcloud[bot]", "hmm"),
            comment("c2", "bob", "lgtm with nits"),
        ];
        let options = FilterOptions {
            exclude_author: true,
            allowed_bots: vec![],
        };
        let filtered = filter_comments(comments, "ai-dev", &options);
        let ids: Vec<&str> = filtered.iter().map(|c| c.id.as_str()).collect();
        assert_that!(ids, eq(&vec!["c2"]));
    }
}
