//! Impression tracking injection for VAST documents.

use crate::auction::types::{AggregatedBid, MediaType};
use crate::settings::Settings;

use super::{event_url, vast_modification_allowed, EventFormat, EventRequest, EventType};

const IMPRESSION_OPEN: &str = "<Impression>";
const IMPRESSION_CLOSE: &str = "</Impression>";

/// Adds `tracking_url` as an impression tracker.
///
/// An empty `<Impression></Impression>` pair is filled in place; otherwise a
/// new `<Impression>` element is added right after the first closing tag.
/// Returns `None`, leaving the document alone, when it has no `</Impression>`.
#[must_use]
pub fn inject_impression(vast: &str, tracking_url: &str) -> Option<String> {
    let close = vast.find(IMPRESSION_CLOSE)?;
    let tracker = format!("<![CDATA[{tracking_url}]]>");

    let mut modified = String::with_capacity(vast.len() + tracker.len() + 32);
    match vast.find(IMPRESSION_OPEN) {
        Some(open) if open + IMPRESSION_OPEN.len() == close => {
            modified.push_str(&vast[..close]);
            modified.push_str(&tracker);
            modified.push_str(&vast[close..]);
        }
        _ => {
            let after_close = close + IMPRESSION_CLOSE.len();
            modified.push_str(&vast[..after_close]);
            modified.push_str(IMPRESSION_OPEN);
            modified.push_str(&tracker);
            modified.push_str(IMPRESSION_CLOSE);
            modified.push_str(&vast[after_close..]);
        }
    }
    Some(modified)
}

/// Injects this exchange's impression event for one bid.
#[must_use]
pub fn modify_vast(
    external_url: &str,
    vast: &str,
    bid_id: &str,
    bidder: &str,
    account_id: &str,
    timestamp: i64,
) -> Option<String> {
    let url = event_url(
        external_url,
        &EventRequest {
            event_type: EventType::Imp,
            bid_id,
            account_id,
            bidder: Some(bidder),
            timestamp,
            format: Some(EventFormat::Blank),
            analytics: None,
        },
    );
    inject_impression(vast, &url)
}

/// Adds impression tracking to inline VAST of video bids.
///
/// Only applies when the account has events enabled; each bidder must also
/// allow VAST modification. Returns how many bids were changed.
pub fn track_video_bids(
    settings: &Settings,
    account_id: &str,
    bids: &mut [AggregatedBid],
    timestamp: i64,
) -> usize {
    let events_enabled = settings
        .accounts
        .get(account_id)
        .is_some_and(|account| account.events_enabled);
    if !events_enabled {
        return 0;
    }

    let mut modified = 0;
    for bid in bids.iter_mut() {
        if bid.media_type != MediaType::Video || !vast_modification_allowed(settings, &bid.bidder) {
            continue;
        }
        let Some(adm) = bid.adm.as_deref() else {
            continue;
        };
        if let Some(tracked) = modify_vast(
            &settings.host.external_url,
            adm,
            &bid.bid_id,
            &bid.bidder,
            account_id,
            timestamp,
        ) {
            bid.adm = Some(tracked);
            modified += 1;
        }
    }
    modified
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::tests::create_test_settings;

    const TRACKER: &str = "https://exchange.test/event?t=imp&b=b1&a=acct-1&bidder=alpha&f=b&ts=1000";

    #[test]
    fn test_no_impression_passes_through() {
        let vast = "<VAST><Ad><InLine></InLine></Ad></VAST>";
        assert_eq!(inject_impression(vast, TRACKER), None);
    }

    #[test]
    fn test_empty_impression_is_filled() {
        let vast = "<VAST><Ad><InLine><Impression></Impression></InLine></Ad></VAST>";

        assert_eq!(
            inject_impression(vast, TRACKER).as_deref(),
            Some(format!(
                "<VAST><Ad><InLine><Impression><![CDATA[{TRACKER}]]></Impression></InLine></Ad></VAST>"
            )
            .as_str())
        );
    }

    #[test]
    fn test_existing_impression_gets_sibling() {
        let vast = "<VAST><Ad><Wrapper><Impression>https://partner.test/imp</Impression><Impression>https://other.test</Impression></Wrapper></Ad></VAST>";

        let modified = inject_impression(vast, TRACKER).expect("should inject");

        assert_eq!(
            modified,
            format!(
                "<VAST><Ad><Wrapper><Impression>https://partner.test/imp</Impression><Impression><![CDATA[{TRACKER}]]></Impression><Impression>https://other.test</Impression></Wrapper></Ad></VAST>"
            )
        );
        assert_eq!(modified.matches("<![CDATA[").count(), 1, "only one tracker added");
    }

    #[test]
    fn test_modify_vast_builds_event_url() {
        let vast = "<VAST><Impression></Impression></VAST>";

        let modified = modify_vast("https://exchange.test", vast, "b1", "alpha", "acct-1", 1000)
            .expect("should inject");

        assert_eq!(
            modified,
            format!("<VAST><Impression><![CDATA[{TRACKER}]]></Impression></VAST>")
        );
    }

    fn video_bid(bidder: &str) -> AggregatedBid {
        AggregatedBid {
            code: "video-1".to_string(),
            bid_id: "v-1".to_string(),
            bidder: bidder.to_string(),
            creative_id: "cr".to_string(),
            price: 4.0,
            currency: "USD".to_string(),
            adm: Some("<VAST><Impression></Impression></VAST>".to_string()),
            nurl: None,
            width: 640,
            height: 480,
            deal_id: None,
            media_type: MediaType::Video,
            deal_priority: 0,
            meta: None,
            response_time_ms: 20,
            cache_id: None,
            cache_url: None,
            ad_server_targeting: Default::default(),
        }
    }

    #[test]
    fn test_track_video_bids_requires_account_events() {
        let settings = create_test_settings();
        let mut bids = vec![video_bid("alpha")];

        assert_eq!(track_video_bids(&settings, "acct-1", &mut bids, 1000), 0);
        assert_eq!(
            bids[0].adm.as_deref(),
            Some("<VAST><Impression></Impression></VAST>")
        );
    }

    #[test]
    fn test_track_video_bids_per_bidder() {
        let settings = create_test_settings();
        let mut bids = vec![video_bid("alpha"), video_bid("beta")];

        assert_eq!(track_video_bids(&settings, "acct-dense", &mut bids, 1000), 1);
        assert!(bids[0]
            .adm
            .as_deref()
            .is_some_and(|adm| adm.contains("a=acct-dense&bidder=alpha")));
        assert_eq!(
            bids[1].adm.as_deref(),
            Some("<VAST><Impression></Impression></VAST>"),
            "beta does not allow VAST modification"
        );
    }
}
