use crate::detect::Claim;
use crate::registry::{Profile, Target};
use chrono::{TimeZone, Utc};

const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

/// First and last 8 characters, for addresses too long to read.
pub fn shorten(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= 19 {
        return s.to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 8..].iter().collect();
    format!("{}...{}", head, tail)
}

// Legacy Markdown only honours backslash escapes outside entities, so
// user-supplied names are always rendered as plain text.
fn escape_markdown(s: &str) -> String {
    s.replace('_', "\\_")
        .replace('*', "\\*")
        .replace('[', "\\[")
        .replace('`', "'")
}

fn format_time(unix: i64) -> String {
    match Utc.timestamp_opt(unix, 0).single() {
        Some(t) => t.format("%-d %b %Y, %H:%M UTC").to_string(),
        None => "unknown".to_string(),
    }
}

/// Alert for one (subscriber, claim) pair.
pub fn render_claim_alert(claim: &Claim, target: &Target, subscriber: &Profile) -> String {
    let token = claim
        .display
        .token
        .as_deref()
        .map(shorten)
        .unwrap_or_else(|| "Unknown".to_string());

    let mut message = String::from("🚨 *Fee Claim Alert!*\n\n");
    if let Some(handle) = &target.handle {
        message.push_str(&format!("👤 User: @{}\n", escape_markdown(handle)));
    }
    message.push_str(&format!(
        "💰 Wallet: `{}`\n\
         🪙 Token: `{}`\n\
         💸 Credited: {:.4} SOL\n\
         ⏰ Time: {}\n\n\
         🔗 [View Transaction](https://solscan.io/tx/{})\n\
         🔍 [View Wallet](https://solscan.io/account/{})",
        shorten(&claim.target),
        token,
        claim.evidence.credited_lamports as f64 / LAMPORTS_PER_SOL,
        format_time(claim.occurred_at),
        claim.display.signature,
        claim.target,
    ));

    let name = if subscriber.display_name.is_empty() {
        &subscriber.subscriber_id
    } else {
        &subscriber.display_name
    };
    message.push_str(&format!(
        "\n\nTracked for @{}",
        escape_markdown(name.trim_start_matches('@'))
    ));
    message
}
