//! Generic OpenRTB 2.x adapter.
//!
//! Every `[adapters.<bidder>]` entry in settings is served by an instance of
//! this adapter: one imp per placement, bidder params under `imp.ext.bidder`,
//! seat bids read back from the standard response shape.

use std::sync::Arc;

use crate::auction::types::{
    BidderJob, BidderResponse, MediaType, RawBid, TypedBid,
};
use crate::http_client::{OutboundRequest, RawResponse};
use crate::openrtb::{
    Banner, Format, Imp, ImpExt, OpenRtbRequest, OpenRtbResponse, Regs, RegsExt, Site, User,
    UserExt, Video,
};
use crate::privacy::GdprSignal;
use crate::settings::Settings;

use super::{check_response_status, Adapter, AdapterError};

const DEFAULT_CURRENCY: &str = "USD";

pub struct OpenRtbAdapter {
    bidder: String,
    endpoint: String,
}

impl OpenRtbAdapter {
    #[must_use]
    pub fn new(bidder: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            bidder: bidder.into(),
            endpoint: endpoint.into(),
        }
    }

    fn to_openrtb(&self, job: &BidderJob) -> (OpenRtbRequest, Vec<AdapterError>) {
        let mut errors = Vec::new();
        let mut imps = Vec::with_capacity(job.placements.len());

        for placement in &job.placements {
            if !placement.params.is_object() {
                errors.push(AdapterError::bad_input(format!(
                    "{} params for ad unit '{}' must be an object",
                    self.bidder, placement.code
                )));
                continue;
            }

            let banner = placement
                .media_types
                .contains(&MediaType::Banner)
                .then(|| Banner {
                    format: placement
                        .sizes
                        .iter()
                        .map(|size| Format {
                            w: size.w,
                            h: size.h,
                        })
                        .collect(),
                });

            let video = placement
                .media_types
                .contains(&MediaType::Video)
                .then(|| Video {
                    w: placement.sizes.first().map(|size| size.w),
                    h: placement.sizes.first().map(|size| size.h),
                    mimes: vec!["video/mp4".to_string()],
                });

            if banner.is_none() && video.is_none() {
                errors.push(AdapterError::bad_input(format!(
                    "{} supports only banner and video; ad unit '{}' has neither",
                    self.bidder, placement.code
                )));
                continue;
            }

            imps.push(Imp {
                id: placement.code.clone(),
                banner,
                video,
                ext: Some(ImpExt {
                    bidder: placement.params.clone(),
                }),
            });
        }

        let request = &job.request;
        let privacy = &request.privacy;

        let site = request.app.is_none().then(|| Site {
            domain: request.page.domain.clone(),
            page: request.page.url.clone(),
        });

        let user = (job.buyer_uid.is_some() || !privacy.consent.is_empty()).then(|| User {
            buyeruid: job.buyer_uid.clone(),
            ext: (!privacy.consent.is_empty()).then(|| UserExt {
                consent: Some(privacy.consent.clone()),
            }),
        });

        let gdpr = match privacy.gdpr {
            GdprSignal::Yes => Some(1),
            GdprSignal::No => Some(0),
            GdprSignal::Ambiguous => None,
        };
        let us_privacy = (!privacy.us_privacy.is_empty()).then(|| privacy.us_privacy.clone());
        let regs = (gdpr.is_some() || us_privacy.is_some()).then(|| Regs {
            ext: Some(RegsExt { gdpr, us_privacy }),
        });

        let openrtb = OpenRtbRequest {
            id: request.tid.clone(),
            imp: imps,
            site,
            app: request.app.clone(),
            device: request.device.clone(),
            user,
            regs,
            tmax: Some(request.timeout_ms),
            cur: vec![DEFAULT_CURRENCY.to_string()],
            extra: Default::default(),
        };

        (openrtb, errors)
    }

    /// Media type for a bid: the bidder's own claim, else inferred from the imp we sent.
    fn media_type_for(bid: &crate::openrtb::Bid, sent: Option<&OpenRtbRequest>) -> MediaType {
        if let Some(claimed) = bid
            .ext
            .as_ref()
            .and_then(|ext| ext.prebid.as_ref())
            .and_then(|prebid| prebid.bid_type.as_deref())
            .and_then(MediaType::from_name)
        {
            return claimed;
        }

        sent.and_then(|request| request.imp.iter().find(|imp| imp.id == bid.impid))
            .map_or(MediaType::Banner, |imp| {
                if imp.banner.is_none() && imp.video.is_some() {
                    MediaType::Video
                } else {
                    MediaType::Banner
                }
            })
    }
}

impl Adapter for OpenRtbAdapter {
    fn bidder_code(&self) -> &str {
        &self.bidder
    }

    fn build_requests(&self, job: &BidderJob) -> (Vec<OutboundRequest>, Vec<AdapterError>) {
        let (openrtb, mut errors) = self.to_openrtb(job);
        if openrtb.imp.is_empty() {
            return (Vec::new(), errors);
        }

        match serde_json::to_vec(&openrtb) {
            Ok(body) => (vec![OutboundRequest::post_json(&self.endpoint, body)], errors),
            Err(e) => {
                errors.push(AdapterError::bad_input(format!(
                    "Failed to encode request for {}: {}",
                    self.bidder, e
                )));
                (Vec::new(), errors)
            }
        }
    }

    fn parse_response(
        &self,
        request: &OutboundRequest,
        response: &RawResponse,
    ) -> (Option<BidderResponse>, Vec<AdapterError>) {
        match check_response_status(response) {
            Ok(true) => {}
            Ok(false) => return (None, Vec::new()),
            Err(e) => return (None, vec![e]),
        }

        let parsed: OpenRtbResponse = match serde_json::from_slice(&response.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return (
                    None,
                    vec![AdapterError::bad_server_response(format!(
                        "Failed to decode {} response: {}",
                        self.bidder, e
                    ))],
                )
            }
        };

        let sent: Option<OpenRtbRequest> = serde_json::from_slice(&request.body).ok();
        let mut bidder_response =
            BidderResponse::new(parsed.cur.as_deref().unwrap_or(DEFAULT_CURRENCY));

        for seatbid in parsed.seatbid {
            for bid in seatbid.bid {
                let media_type = Self::media_type_for(&bid, sent.as_ref());
                let deal_priority = bid
                    .ext
                    .as_ref()
                    .and_then(|ext| ext.prebid.as_ref())
                    .and_then(|prebid| prebid.deal_priority)
                    .unwrap_or(0);
                let meta = bid
                    .ext
                    .as_ref()
                    .and_then(|ext| ext.extra.get("meta"))
                    .cloned();

                bidder_response.bids.push(TypedBid {
                    bid: RawBid {
                        id: bid.id,
                        impid: bid.impid,
                        price: bid.price,
                        adm: bid.adm,
                        nurl: bid.nurl,
                        crid: bid.crid,
                        w: bid.w,
                        h: bid.h,
                        deal_id: bid.dealid,
                    },
                    media_type,
                    deal_priority,
                    meta,
                });
            }
        }

        (Some(bidder_response), Vec::new())
    }
}

/// Builds an adapter for every enabled `[adapters.*]` entry.
#[must_use]
pub fn register_adapters(settings: &Settings) -> Vec<Arc<dyn Adapter>> {
    let mut bidders: Vec<&String> = settings.adapters.keys().collect();
    bidders.sort();

    let mut adapters: Vec<Arc<dyn Adapter>> = Vec::new();
    for bidder in bidders {
        let Some(config) = settings.adapters.get(bidder) else {
            continue;
        };
        if !config.enabled {
            log::info!("Adapter '{}' is disabled, skipping", bidder);
            continue;
        }
        adapters.push(Arc::new(OpenRtbAdapter::new(bidder.clone(), config.endpoint.clone())));
    }

    adapters
}
