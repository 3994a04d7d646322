//! Merges per-bidder job results into the response bid set.

use super::types::{
    AdapterStatus, AggregatedBid, AuctionRequest, BidderStatus, JobResult, MediaType, Size,
    TypedBid,
};

/// Bids and per-bidder statuses produced from one dispatch.
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub bids: Vec<AggregatedBid>,
    pub bidder_status: Vec<BidderStatus>,
}

/// Why a single bid did not survive aggregation.
enum Rejection {
    UnknownAdUnit,
    NoPrice,
    AmbiguousSize(usize),
}

pub struct ResponseAggregator;

impl ResponseAggregator {
    /// Folds `results` into emitted bids and one status per result.
    ///
    /// Bids keep arrival order across bidders and parse order within one.
    /// Bids for unknown ad units or with no positive price are dropped, and
    /// banner bids without a size are reconciled against the ad unit.
    #[must_use]
    pub fn aggregate(request: &AuctionRequest, results: Vec<JobResult>) -> Aggregation {
        let mut aggregation = Aggregation::default();

        for result in results {
            let JobResult {
                bidder,
                status,
                currency,
                bids,
                mut errors,
                elapsed_ms,
            } = result;

            let currency = if currency.is_empty() {
                "USD".to_string()
            } else {
                currency
            };
            let mut accepted = 0;

            for typed in bids {
                match Self::reconcile(request, &bidder, &currency, typed, elapsed_ms) {
                    Ok(bid) => {
                        accepted += 1;
                        aggregation.bids.push(bid);
                    }
                    Err((bid_id, Rejection::AmbiguousSize(sizes))) => {
                        log::debug!(
                            "Dropping sizeless bid '{}' from '{}': ad unit has {} sizes",
                            bid_id,
                            bidder,
                            sizes
                        );
                        errors.push(format!(
                            "Bid '{bid_id}' has no size and the ad unit accepts {sizes} sizes"
                        ));
                    }
                    Err((bid_id, Rejection::UnknownAdUnit)) => {
                        log::warn!("Dropping bid '{}' from '{}' for unknown ad unit", bid_id, bidder);
                        errors.push(format!("Bid '{bid_id}' references an unknown ad unit"));
                    }
                    Err((bid_id, Rejection::NoPrice)) => {
                        log::debug!("Dropping zero-price bid '{}' from '{}'", bid_id, bidder);
                    }
                }
            }

            let status = if status == AdapterStatus::Ok && accepted == 0 {
                AdapterStatus::NoBid
            } else {
                status
            };

            let ad_unit_count = request
                .ad_units
                .iter()
                .filter(|unit| unit.bid_id_for(&bidder).is_some())
                .count();

            aggregation.bidder_status.push(BidderStatus {
                bidder,
                ad_unit_count,
                status,
                response_time_ms: elapsed_ms,
                num_bids: accepted,
                error: (!errors.is_empty()).then(|| errors.join("; ")),
                no_cookie: false,
                usersync: None,
            });
        }

        aggregation
    }

    fn reconcile(
        request: &AuctionRequest,
        bidder: &str,
        currency: &str,
        typed: TypedBid,
        elapsed_ms: u64,
    ) -> Result<AggregatedBid, (String, Rejection)> {
        let TypedBid {
            bid,
            media_type,
            deal_priority,
            meta,
        } = typed;

        let Some(unit) = request.ad_unit(&bid.impid) else {
            return Err((bid.id, Rejection::UnknownAdUnit));
        };
        if bid.price <= 0.0 {
            return Err((bid.id, Rejection::NoPrice));
        }

        let mut size = Size { w: bid.w, h: bid.h };
        if media_type == MediaType::Banner && (size.w == 0 || size.h == 0) {
            match unit.sizes.as_slice() {
                [only] => size = *only,
                sizes => return Err((bid.id, Rejection::AmbiguousSize(sizes.len()))),
            }
        }

        Ok(AggregatedBid {
            code: unit.code.clone(),
            bid_id: unit.bid_id_for(bidder).unwrap_or(bid.id.as_str()).to_string(),
            bidder: bidder.to_string(),
            creative_id: bid.crid.unwrap_or_default(),
            price: bid.price,
            currency: currency.to_string(),
            adm: bid.adm,
            nurl: bid.nurl,
            width: size.w,
            height: size.h,
            deal_id: bid.deal_id,
            media_type,
            deal_priority,
            meta,
            response_time_ms: elapsed_ms,
            cache_id: None,
            cache_url: None,
            ad_server_targeting: Default::default(),
        })
    }
}
