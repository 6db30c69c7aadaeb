//! Message bodies, in the channel's HTML parse mode.

use crate::extract::{escape_html, ExtractionResult};
use crate::stats::CycleStats;
use chrono::{DateTime, Local};
use std::fmt::Write;

const RULE: &str = "----------------------------------------";

/// Alert for the offers in `result`. Offer and metadata fields are
/// already escaped; the URL is escaped here.
pub fn format_alert(result: &ExtractionResult, event_url: &str) -> String {
    let mut msg = String::new();
    let _ = writeln!(
        msg,
        "🚨 <b>Found {} ticket(s) for {}</b>",
        result.offers.len(),
        result.event_name
    );
    let _ = writeln!(msg, "📍 <b>Location</b>: {}", result.location);
    let _ = writeln!(msg, "📅 <b>Date</b>: {}", result.event_date);
    let _ = writeln!(msg, "🔗 <a href=\"{}\">Event Link</a>", escape_html(event_url));
    let _ = writeln!(msg, "{}", RULE);
    for (i, offer) in result.offers.iter().enumerate() {
        let _ = writeln!(msg, "🎟️ <b>Ticket {}</b>: <b>{}</b>", i + 1, offer.kind);
        let _ = writeln!(msg, "   💷 <b>Price</b>: {}", offer.price);
        let _ = writeln!(msg, "   🔢 <b>Quantity</b>: {}", offer.quantity);
        let _ = writeln!(msg, "{}", RULE);
    }
    msg
}

pub fn format_heartbeat(stats: &CycleStats, now: DateTime<Local>) -> String {
    format!(
        "⏰ <b>Update</b> ({}):\n🎫 <b>Tickets Spotted</b>: {}\n⚠️ <b>Errors</b>: {}\n",
        now.format("%H:%M"),
        stats.tickets_spotted,
        stats.error_count
    )
}
