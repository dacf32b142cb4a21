//! Model-name matching policy.
//!
//! Clients and channels frequently disagree on model naming — dated snapshots
//! (`claude-3-5-sonnet-20241022`) versus rolling aliases, vendor prefixes,
//! case differences. Matching runs in three stages, each gated by a runtime
//! flag:
//!
//! 1. exact match (always on),
//! 2. strip-date fallback: remove a trailing `-YYYYMMDD` (validated as a real
//!    calendar date, year 2000–2100) from either side,
//! 3. fuzzy: case-insensitive substring match, tie-broken by the most recent
//!    embedded date among the channel's matching entries.
//!
//! The wildcard entry `*` in a channel's model list matches every request,
//! and the wildcard request `*` matches every channel.

use chrono::NaiveDate;

use crate::store::Channel;

/// Which relaxations are enabled — mirrors two runtime settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchOpts {
    pub strip_date: bool,
    pub fuzzy: bool,
}

/// How a channel ended up matching a requested model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    Exact,
    Wildcard,
    StripDate,
    Fuzzy,
}

/// Remove a trailing `-YYYYMMDD` when it is a real calendar date in
/// 2000..=2100. Returns `None` when nothing strippable is present.
pub fn strip_trailing_date(model: &str) -> Option<&str> {
    let (prefix, suffix) = model.rsplit_once('-')?;
    if suffix.len() != 8 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = suffix[..4].parse().ok()?;
    if !(2000..=2100).contains(&year) {
        return None;
    }
    let month: u32 = suffix[4..6].parse().ok()?;
    let day: u32 = suffix[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)?;
    if prefix.is_empty() {
        return None;
    }
    Some(prefix)
}

/// The date embedded in a model name's trailing snapshot suffix, if any.
/// Used to prefer newer snapshots when fuzzy matching is ambiguous.
pub fn embedded_date(model: &str) -> Option<NaiveDate> {
    let (_, suffix) = model.rsplit_once('-')?;
    if suffix.len() != 8 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = suffix[..4].parse().ok()?;
    if !(2000..=2100).contains(&year) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, suffix[4..6].parse().ok()?, suffix[6..8].parse().ok()?)
}

/// Does `channel` support `model` under `opts`? Returns the rule that made
/// the match so callers can attribute relaxed matches.
pub fn channel_supports(channel: &Channel, model: &str, opts: MatchOpts) -> Option<MatchRule> {
    if model == "*" || channel.models.iter().any(|m| m == "*") {
        return Some(MatchRule::Wildcard);
    }
    if channel.models.iter().any(|m| m == model) {
        return Some(MatchRule::Exact);
    }

    if opts.strip_date {
        let stripped_request = strip_trailing_date(model);
        for entry in &channel.models {
            if stripped_request == Some(entry.as_str()) {
                return Some(MatchRule::StripDate);
            }
            if strip_trailing_date(entry) == Some(model) {
                return Some(MatchRule::StripDate);
            }
        }
    }

    if opts.fuzzy && best_fuzzy_entry(channel, model).is_some() {
        return Some(MatchRule::Fuzzy);
    }

    None
}

/// The channel model entry that fuzzy-matches `model`, preferring the entry
/// with the most recent embedded date (dateless entries rank last).
pub fn best_fuzzy_entry<'a>(channel: &'a Channel, model: &str) -> Option<&'a str> {
    let needle = model.to_lowercase();
    channel
        .models
        .iter()
        .filter(|entry| {
            let hay = entry.to_lowercase();
            hay.contains(&needle) || needle.contains(&hay)
        })
        .max_by_key(|entry| embedded_date(entry))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChannelType, NewChannel};

    fn channel_with(models: &[&str]) -> Channel {
        let new = NewChannel::basic("c", ChannelType::Anthropic, "https://x", models);
        Channel {
            id: 1,
            name: new.name,
            channel_type: new.channel_type,
            preset: None,
            base_url: new.base_url,
            priority: 10,
            enabled: true,
            models: new.models,
            redirects: Default::default(),
            openai_compatible: false,
            key_strategy: Default::default(),
            key_count: 0,
            endpoints: vec![],
        }
    }

    // -----------------------------------------------------------------------
    // strip_trailing_date
    // -----------------------------------------------------------------------

    #[test]
    fn strips_valid_snapshot_date() {
        assert_eq!(
            strip_trailing_date("claude-3-5-sonnet-20241022"),
            Some("claude-3-5-sonnet")
        );
    }

    #[test]
    fn invalid_calendar_dates_do_not_strip() {
        // Month 13 and Feb 30 are not real dates.
        assert_eq!(strip_trailing_date("claude-3-5-sonnet-20241302"), None);
        assert_eq!(strip_trailing_date("claude-3-5-sonnet-20240230"), None);
    }

    #[test]
    fn out_of_range_years_do_not_strip() {
        assert_eq!(strip_trailing_date("model-19991231"), None);
        assert_eq!(strip_trailing_date("model-21011231"), None);
    }

    #[test]
    fn non_date_suffixes_do_not_strip() {
        assert_eq!(strip_trailing_date("gpt-4o"), None);
        assert_eq!(strip_trailing_date("claude-3-5-sonnet"), None);
        assert_eq!(strip_trailing_date("model-2024102"), None); // 7 digits
    }

    #[test]
    fn bare_date_does_not_strip_to_empty() {
        assert_eq!(strip_trailing_date("-20241022"), None);
    }

    // -----------------------------------------------------------------------
    // channel_supports
    // -----------------------------------------------------------------------

    #[test]
    fn exact_match_wins_without_relaxations() {
        let ch = channel_with(&["claude-sonnet-4-5"]);
        assert_eq!(
            channel_supports(&ch, "claude-sonnet-4-5", MatchOpts::default()),
            Some(MatchRule::Exact)
        );
        assert_eq!(channel_supports(&ch, "claude-opus-4-1", MatchOpts::default()), None);
    }

    #[test]
    fn wildcard_entry_matches_everything() {
        let ch = channel_with(&["*"]);
        assert_eq!(
            channel_supports(&ch, "anything-at-all", MatchOpts::default()),
            Some(MatchRule::Wildcard)
        );
    }

    #[test]
    fn wildcard_request_matches_every_channel() {
        let ch = channel_with(&["claude-sonnet-4-5"]);
        assert_eq!(
            channel_supports(&ch, "*", MatchOpts::default()),
            Some(MatchRule::Wildcard)
        );
    }

    #[test]
    fn strip_date_applies_to_request_side() {
        let ch = channel_with(&["claude-3-5-sonnet"]);
        let opts = MatchOpts { strip_date: true, fuzzy: false };
        assert_eq!(
            channel_supports(&ch, "claude-3-5-sonnet-20241022", opts),
            Some(MatchRule::StripDate)
        );
        // Disabled flag keeps the miss.
        assert_eq!(
            channel_supports(&ch, "claude-3-5-sonnet-20241022", MatchOpts::default()),
            None
        );
    }

    #[test]
    fn strip_date_applies_to_channel_side() {
        let ch = channel_with(&["claude-3-5-sonnet-20241022"]);
        let opts = MatchOpts { strip_date: true, fuzzy: false };
        assert_eq!(
            channel_supports(&ch, "claude-3-5-sonnet", opts),
            Some(MatchRule::StripDate)
        );
    }

    #[test]
    fn fuzzy_is_case_insensitive_substring() {
        let ch = channel_with(&["Claude-Sonnet-4-5-Preview"]);
        let opts = MatchOpts { strip_date: false, fuzzy: true };
        assert_eq!(
            channel_supports(&ch, "claude-sonnet-4-5", opts),
            Some(MatchRule::Fuzzy)
        );
        assert_eq!(channel_supports(&ch, "gemini-2.5-pro", opts), None);
    }

    #[test]
    fn fuzzy_prefers_most_recent_embedded_date() {
        let ch = channel_with(&[
            "claude-3-5-sonnet-20240620",
            "claude-3-5-sonnet-20241022",
            "claude-3-5-sonnet",
        ]);
        assert_eq!(
            best_fuzzy_entry(&ch, "claude-3-5-sonnet"),
            Some("claude-3-5-sonnet-20241022")
        );
    }
}
