//! Ad-server targeting keys for ranked bids.

use std::collections::BTreeMap;

use crate::constants::{
    TARGETING_KEY_BIDDER, TARGETING_KEY_CACHE_ID, TARGETING_KEY_DEAL, TARGETING_KEY_PRICE,
    TARGETING_KEY_SIZE,
};

use super::price_granularity::PriceGranularity;
use super::types::AggregatedBid;

/// Computes `hb_*` keys per ad unit.
#[derive(Debug, Clone)]
pub struct Targeter {
    granularity: PriceGranularity,
    max_key_length: usize,
}

impl Targeter {
    #[must_use]
    pub fn new(granularity: PriceGranularity, max_key_length: usize) -> Self {
        Self {
            granularity,
            max_key_length,
        }
    }

    /// Replaces the targeting of every bid in `bids`.
    ///
    /// Within each ad unit bids are ranked by price, highest first, with ties
    /// going to the bid that appears first. Every bid gets bidder-suffixed
    /// keys; the winner also gets the unsuffixed ones. The order of `bids`
    /// itself is left untouched.
    pub fn apply(&self, bids: &mut [AggregatedBid]) {
        for bid in bids.iter_mut() {
            bid.ad_server_targeting.clear();
        }

        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (index, bid) in bids.iter().enumerate() {
            match groups.iter_mut().find(|(code, _)| *code == bid.code) {
                Some((_, members)) => members.push(index),
                None => groups.push((bid.code.clone(), vec![index])),
            }
        }

        for (code, mut members) in groups {
            members.sort_by(|a, b| bids[*b].price.total_cmp(&bids[*a].price));

            for (rank, index) in members.into_iter().enumerate() {
                let bid = &mut bids[index];
                let values = self.values_for(bid);
                let mut targeting = BTreeMap::new();

                for (key, value) in &values {
                    let scoped = format!("{key}_{}", bid.bidder);
                    targeting.insert(self.truncate(scoped), value.clone());
                }
                if rank == 0 {
                    log::debug!("Ad unit '{}' won by '{}' at {}", code, bid.bidder, bid.price);
                    for (key, value) in values {
                        targeting.insert(self.truncate(key.to_string()), value);
                    }
                }

                bid.ad_server_targeting = targeting;
            }
        }
    }

    fn values_for(&self, bid: &AggregatedBid) -> Vec<(&'static str, String)> {
        let mut values = vec![
            (TARGETING_KEY_PRICE, self.granularity.bucket(bid.price)),
            (TARGETING_KEY_BIDDER, bid.bidder.clone()),
        ];
        if let Some(cache_id) = &bid.cache_id {
            values.push((TARGETING_KEY_CACHE_ID, cache_id.clone()));
        }
        if bid.width != 0 && bid.height != 0 {
            values.push((TARGETING_KEY_SIZE, format!("{}x{}", bid.width, bid.height)));
        }
        if let Some(deal_id) = &bid.deal_id {
            values.push((TARGETING_KEY_DEAL, deal_id.clone()));
        }
        values
    }

    fn truncate(&self, mut key: String) -> String {
        if self.max_key_length > 0 && key.len() > self.max_key_length {
            let mut end = self.max_key_length;
            while !key.is_char_boundary(end) {
                end -= 1;
            }
            key.truncate(end);
        }
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::types::MediaType;

    fn bid(code: &str, bidder: &str, price: f64) -> AggregatedBid {
        AggregatedBid {
            code: code.to_string(),
            bid_id: format!("{bidder}-{code}"),
            bidder: bidder.to_string(),
            creative_id: "cr".to_string(),
            price,
            currency: "USD".to_string(),
            adm: None,
            nurl: None,
            width: 300,
            height: 250,
            deal_id: None,
            media_type: MediaType::Banner,
            deal_priority: 0,
            meta: None,
            response_time_ms: 10,
            cache_id: None,
            cache_url: None,
            ad_server_targeting: BTreeMap::new(),
        }
    }

    fn targeter() -> Targeter {
        Targeter::new(PriceGranularity::from_name("med"), 0)
    }

    #[test]
    fn test_winner_gets_unscoped_keys() {
        let mut bids = vec![bid("div-1", "alpha", 1.23), bid("div-1", "beta", 2.51)];
        targeter().apply(&mut bids);

        let beta = &bids[1].ad_server_targeting;
        assert_eq!(beta.get("hb_pb").map(String::as_str), Some("2.50"));
        assert_eq!(beta.get("hb_bidder").map(String::as_str), Some("beta"));
        assert_eq!(beta.get("hb_size").map(String::as_str), Some("300x250"));
        assert_eq!(beta.get("hb_pb_beta").map(String::as_str), Some("2.50"));

        let alpha = &bids[0].ad_server_targeting;
        assert_eq!(alpha.get("hb_pb_alpha").map(String::as_str), Some("1.20"));
        assert_eq!(alpha.get("hb_bidder_alpha").map(String::as_str), Some("alpha"));
        assert!(!alpha.contains_key("hb_pb"), "loser gets no unscoped keys");
    }

    #[test]
    fn test_tie_goes_to_first_seen() {
        let mut bids = vec![bid("div-1", "alpha", 1.0), bid("div-1", "beta", 1.0)];
        targeter().apply(&mut bids);

        assert!(bids[0].ad_server_targeting.contains_key("hb_pb"));
        assert!(!bids[1].ad_server_targeting.contains_key("hb_pb"));
    }

    #[test]
    fn test_ad_units_ranked_independently() {
        let mut bids = vec![
            bid("div-1", "alpha", 1.0),
            bid("div-2", "alpha", 0.5),
            bid("div-2", "beta", 0.2),
        ];
        targeter().apply(&mut bids);

        assert!(bids[0].ad_server_targeting.contains_key("hb_pb"));
        assert!(bids[1].ad_server_targeting.contains_key("hb_pb"));
        assert!(!bids[2].ad_server_targeting.contains_key("hb_pb"));
    }

    #[test]
    fn test_optional_keys() {
        let mut with_extras = bid("div-1", "alpha", 3.0);
        with_extras.cache_id = Some("uuid-1".to_string());
        with_extras.deal_id = Some("deal-7".to_string());
        let mut sizeless = bid("div-2", "beta", 1.0);
        sizeless.width = 0;
        let mut bids = vec![with_extras, sizeless];

        targeter().apply(&mut bids);

        let extras = &bids[0].ad_server_targeting;
        assert_eq!(extras.get("hb_cache_id").map(String::as_str), Some("uuid-1"));
        assert_eq!(extras.get("hb_deal_alpha").map(String::as_str), Some("deal-7"));
        assert!(!bids[1].ad_server_targeting.contains_key("hb_size"));
        assert!(!bids[1].ad_server_targeting.contains_key("hb_deal"));
    }

    #[test]
    fn test_keys_truncated() {
        let mut bids = vec![bid("div-1", "averylongbiddername", 1.0)];
        Targeter::new(PriceGranularity::from_name("med"), 12).apply(&mut bids);

        let targeting = &bids[0].ad_server_targeting;
        assert!(targeting.keys().all(|key| key.len() <= 12));
        assert_eq!(
            targeting.get("hb_bidder_av").map(String::as_str),
            Some("averylongbiddername"),
            "values are never truncated"
        );
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut bids = vec![bid("div-1", "alpha", 1.0), bid("div-1", "beta", 4.2)];
        let targeter = targeter();

        targeter.apply(&mut bids);
        let first = bids.clone();
        targeter.apply(&mut bids);

        assert_eq!(first, bids);
    }
}
