//! Feature signals: heuristic tags marking a listing as a promotion candidate.
//!
//! Signals are advisory only. Nothing in the engine reads them back to change
//! a record's lifecycle state; promotion is a separate administrative action.

use std::collections::BTreeSet;

use crate::config::SignalRules;
use crate::models::ListingDetail;

pub const PARTNER_LISTING: &str = "partner_listing";
pub const RICH_AMENITIES: &str = "rich_amenities";
pub const RICH_MEDIA: &str = "rich_media";
pub const PREMIUM_LOCATION: &str = "premium_location";

/// Evaluates the rule set against an upstream detail.
///
/// Pure: the result depends only on `detail` and `rules`, never on what a
/// stored record already carries. Callers union the result into the record.
pub fn compute_signals(detail: &ListingDetail, rules: &SignalRules) -> BTreeSet<String> {
    let mut signals = BTreeSet::new();

    if detail.is_partner {
        signals.insert(PARTNER_LISTING.to_string());
    }
    if rules.min_facilities > 0 && detail.facility_count >= rules.min_facilities {
        signals.insert(RICH_AMENITIES.to_string());
    }
    if rules.min_images > 0 && detail.image_count >= rules.min_images {
        signals.insert(RICH_MEDIA.to_string());
    }
    if let Some(location) = detail.core.location.as_deref() {
        if rules
            .premium_locations
            .iter()
            .any(|p| p.eq_ignore_ascii_case(location.trim()))
        {
            signals.insert(PREMIUM_LOCATION.to_string());
        }
    }

    signals
}
