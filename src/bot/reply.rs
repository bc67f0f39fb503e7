//! User-facing message rendering.
//!
//! Everything that reaches the chat thread is built here, so the rule that
//! replies never carry credential material or raw role ARNs is enforced in
//! one place. Long replies are split into chunks under the platform message
//! limit, breaking on line boundaries where possible.

use super::directory::AccountRecord;
use super::error::BotError;
use super::query::{is_root_activity, EventDigest, EventDigestItem};
use chrono::SecondsFormat;

/// Conservative per-message character limit, under the platform's 4000.
pub const MAX_REPLY_CHARS: usize = 3900;

/// How many events a reply lists in full before summarizing the rest.
const MAX_LISTED_EVENTS: usize = 25;

pub fn help_text() -> String {
    concat!(
        "I answer questions about CloudTrail activity across our AWS accounts.\n",
        "Tell me which account (name or 12-digit id) and what you want to see:\n",
        "  - \"recent console logins in Acme Prod\"\n",
        "  - \"security review of 123456789012 over the last 7 days\"\n",
        "  - \"failed API calls in \"Acme Dev\" yesterday\"\n",
        "  - \"CreateUser events by user alice 3 days ago\"\n",
        "Follow-ups in the same thread reuse the account you already named.",
    )
    .to_string()
}

pub fn needs_account_prompt() -> String {
    "Which account should I look at? Give me a name or a 12-digit account id.".to_string()
}

/// Numbered candidate list for an ambiguous account reference.
pub fn disambiguation_prompt(reference: &str, candidates: &[AccountRecord]) -> String {
    let mut out = format!(
        "I found {} accounts matching \"{}\". Which one did you mean?\n",
        candidates.len(),
        reference
    );
    for (index, candidate) in candidates.iter().enumerate() {
        out.push_str(&format!(
            "  {}. {} ({})\n",
            index + 1,
            candidate.display_name,
            candidate.account_id
        ));
    }
    out.push_str("Reply with the name or account id.");
    out
}

pub fn account_resolved(account: &AccountRecord) -> String {
    format!(
        "That's {} ({}).",
        account.display_name, account.account_id
    )
}

/// Render a completed query digest. The truncation marker is always surfaced
/// so a partial answer is never mistaken for a complete one.
pub fn render_digest(account: &AccountRecord, digest: &EventDigest) -> String {
    let mut out = String::new();

    if digest.items.is_empty() {
        out.push_str(&format!(
            "No matching events in {} ({}) for that window.",
            account.display_name, account.account_id
        ));
        if digest.truncated {
            out.push_str("\nNote: the search was cut short, so events may have been missed.");
        }
        return out;
    }

    out.push_str(&format!(
        "{} event{} in {} ({}):\n",
        digest.items.len(),
        if digest.items.len() == 1 { "" } else { "s" },
        account.display_name,
        account.account_id
    ));

    for item in digest.items.iter().take(MAX_LISTED_EVENTS) {
        out.push_str(&render_event_line(item));
        out.push('\n');
    }
    if digest.items.len() > MAX_LISTED_EVENTS {
        out.push_str(&format!(
            "  ... and {} more.\n",
            digest.items.len() - MAX_LISTED_EVENTS
        ));
    }

    let root_count = digest.items.iter().filter(|i| is_root_activity(i)).count();
    if root_count > 0 {
        out.push_str(&format!(
            ":warning: {} event{} by the account root user.\n",
            root_count,
            if root_count == 1 { "" } else { "s" }
        ));
    }

    if digest.truncated {
        out.push_str("Note: results are partial; the search hit its time or rate limit.");
    }
    out.trim_end().to_string()
}

fn render_event_line(item: &EventDigestItem) -> String {
    let mut line = format!(
        "  {}  {}  {}",
        item.event_time.to_rfc3339_opts(SecondsFormat::Secs, true),
        item.event_name,
        item.user_identity,
    );
    if let Some(ip) = &item.source_ip_address {
        line.push_str(&format!(" from {}", ip));
    }
    if let Some(code) = &item.error_code {
        line.push_str(&format!(" [{}]", code));
    }
    if item.mfa_used == Some(false) {
        line.push_str(" (no MFA)");
    }
    line
}

/// Translate an error into wording safe for the thread. Role ARNs, external
/// ids, and anything from provider error chains stay out; operators get the
/// full story from logs instead.
pub fn render_error(error: &BotError) -> String {
    match error {
        BotError::DirectoryUnavailable(_) => {
            "I can't reach the account directory right now. Please try again in a minute."
                .to_string()
        }
        BotError::NotFound { reference } => format!(
            "I couldn't find an account matching \"{}\". Try the exact name or the 12-digit id.",
            reference
        ),
        BotError::Ambiguous {
            reference,
            candidates,
        } => disambiguation_prompt(reference, candidates),
        BotError::AssumeRoleDenied { account_id, .. } => format!(
            "I don't have access to account {}. The audit role may not trust me yet.",
            account_id
        ),
        BotError::BridgeUnreachable { account_id } => format!(
            "I couldn't establish access to account {} right now. Please try again shortly.",
            account_id
        ),
        BotError::ExternalIdMismatch { account_id } => format!(
            "Access to account {} is misconfigured. An operator needs to check its trust settings.",
            account_id
        ),
        BotError::CredentialsExpired { account_id } => format!(
            "My access to account {} expired mid-search. Ask again and I'll start fresh.",
            account_id
        ),
        BotError::RateLimited { .. } => {
            "AWS is rate limiting me right now. Please try again in a minute.".to_string()
        }
        BotError::QueryTooBroad { max_days, .. } => format!(
            "That window is too wide. I can search up to {} days at a time.",
            max_days
        ),
        BotError::InternalTimeout { .. } => {
            "That took too long and I gave up. A narrower time window may help.".to_string()
        }
        BotError::InvalidQuery { reason } => format!("I can't run that: {}.", reason),
    }
}

/// Split a reply into chunks of at most [`MAX_REPLY_CHARS`], preferring line
/// boundaries. Always yields at least one chunk.
pub fn chunk_reply(text: &str) -> Vec<String> {
    chunk_with_limit(text, MAX_REPLY_CHARS)
}

fn chunk_with_limit(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if current.len() + line.len() > limit && !current.is_empty() {
            chunks.push(current.trim_end().to_string());
            current = String::new();
        }
        // A single oversized line is split mid-line at char boundaries.
        if line.len() > limit {
            let mut rest = line;
            while rest.len() > limit {
                let mut cut = limit;
                while !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                let (head, tail) = rest.split_at(cut);
                chunks.push(head.trim_end().to_string());
                rest = tail;
            }
            current.push_str(rest);
        } else {
            current.push_str(line);
        }
    }
    if !current.trim_end().is_empty() {
        chunks.push(current.trim_end().to_string());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn account() -> AccountRecord {
        AccountRecord {
            account_id: "123456789012".to_string(),
            display_name: "Acme Prod".to_string(),
            bridge_role_arn: "arn:aws:iam::999999999999:role/bridge".to_string(),
            target_role_arn: "arn:aws:iam::123456789012:role/audit".to_string(),
            external_id: Some("ext-secret-42".to_string()),
        }
    }

    fn item(name: &str) -> EventDigestItem {
        EventDigestItem {
            event_time: Utc::now(),
            event_name: name.to_string(),
            event_source: "iam.amazonaws.com".to_string(),
            source_ip_address: Some("198.51.100.7".to_string()),
            user_identity: "IAMUser/alice".to_string(),
            error_code: None,
            mfa_used: None,
        }
    }

    #[test]
    fn digest_mentions_count_and_account() {
        let digest = EventDigest {
            items: vec![item("CreateUser")],
            truncated: false,
        };
        let text = render_digest(&account(), &digest);
        assert!(text.contains("1 event in Acme Prod (123456789012)"));
        assert!(text.contains("CreateUser"));
        assert!(!text.contains("partial"));
    }

    #[test]
    fn truncated_digest_carries_a_partial_marker() {
        let digest = EventDigest {
            items: vec![item("CreateUser")],
            truncated: true,
        };
        assert!(render_digest(&account(), &digest).contains("partial"));
    }

    #[test]
    fn empty_truncated_digest_warns_about_missed_events() {
        let digest = EventDigest {
            items: vec![],
            truncated: true,
        };
        let text = render_digest(&account(), &digest);
        assert!(text.contains("No matching events"));
        assert!(text.contains("cut short"));
    }

    #[test]
    fn root_activity_is_called_out() {
        let mut root = item("CreateAccessKey");
        root.user_identity = "Root".to_string();
        let digest = EventDigest {
            items: vec![root],
            truncated: false,
        };
        assert!(render_digest(&account(), &digest).contains("root user"));
    }

    #[test]
    fn long_digests_are_summarized() {
        let digest = EventDigest {
            items: (0..40).map(|_| item("ConsoleLogin")).collect(),
            truncated: false,
        };
        assert!(render_digest(&account(), &digest).contains("and 15 more"));
    }

    #[test]
    fn missing_mfa_is_flagged_on_the_line() {
        let mut login = item("ConsoleLogin");
        login.mfa_used = Some(false);
        assert!(render_event_line(&login).contains("(no MFA)"));
    }

    #[test]
    fn error_rendering_never_leaks_arns_or_external_ids() {
        let errors = vec![
            BotError::AssumeRoleDenied {
                hop: crate::bot::error::RoleHop::Target,
                account_id: "123456789012".to_string(),
            },
            BotError::ExternalIdMismatch {
                account_id: "123456789012".to_string(),
            },
            BotError::BridgeUnreachable {
                account_id: "123456789012".to_string(),
            },
            BotError::DirectoryUnavailable(anyhow::anyhow!(
                "ssm get /trailwatch/accounts failed: arn:aws:iam::999999999999:role/bridge"
            )),
        ];
        for error in errors {
            let text = render_error(&error);
            assert!(!text.contains("arn:"), "leaked arn in: {}", text);
            assert!(!text.contains("ext-secret"), "leaked external id in: {}", text);
        }
    }

    #[test]
    fn disambiguation_lists_numbered_candidates() {
        let mut second = account();
        second.account_id = "210987654321".to_string();
        second.display_name = "Acme Dev".to_string();
        let text = disambiguation_prompt("acme", &[account(), second]);
        assert!(text.contains("1. Acme Prod (123456789012)"));
        assert!(text.contains("2. Acme Dev (210987654321)"));
    }

    #[test]
    fn short_replies_are_one_chunk() {
        assert_eq!(chunk_reply("hello"), vec!["hello".to_string()]);
    }

    #[test]
    fn chunks_break_on_line_boundaries() {
        let text = (0..100)
            .map(|i| format!("line number {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_with_limit(&text, 200);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 200);
            assert!(chunk.starts_with("line"));
        }
    }

    #[test]
    fn oversized_single_line_is_split() {
        let text = "x".repeat(500);
        let chunks = chunk_with_limit(&text, 200);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 200));
    }
}
