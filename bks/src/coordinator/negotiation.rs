//! Coordinator side of session establishment
//!
//! After a connection is accepted the coordinator sends the list of service
//! types it still has room for and waits for one offer. The offer is checked
//! against the registered limits and answered with accept or reject:
//!
//! ```text
//! AwaitingOffer --offer ok--> SendingAccept --written--> established
//!      |         \--offer no--> SendingReject --written--> closed
//!      \--anything else / timeout--> aborted
//! ```

use super::config::ServiceConfig;
use super::registry::Registry;
use bks_wire::codec::{Frame, FrameType};
use bks_wire::messages::{to_bytes, OfferedService, ServiceDecision, ServiceType};
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::debug;

/// Limits both sides agreed on for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AcceptedTerms {
    pub service_type: ServiceType,
    pub max_instances: u32,
    pub max_class_instances: u32,
    pub keepalive_secs: u32,
    /// Largest job-response payload the worker may send
    pub max_resp_payload: u32,
}

impl AcceptedTerms {
    pub(crate) fn keepalive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keepalive_secs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OfferVerdict {
    Accept(AcceptedTerms),
    /// Answer with reject-service, then close
    Reject(&'static str),
    /// Close without answering
    Abort(&'static str),
}

/// Check one offer against a registered type.
///
/// `open_sessions` counts established sessions of the type plus accepts
/// still being written.
pub(crate) fn evaluate_offer(
    config: &ServiceConfig,
    open_sessions: u32,
    offer: &OfferedService,
) -> OfferVerdict {
    if offer.service_type != config.service_type {
        return OfferVerdict::Abort("offered type was not requested");
    }
    if !(config.min_provider_version..=config.max_provider_version)
        .contains(&offer.provider_version)
    {
        return OfferVerdict::Reject("provider version out of range");
    }
    if open_sessions >= config.max_sessions {
        return OfferVerdict::Reject("service type is full");
    }

    let max_instances = offer.service_instances.min(config.max_instances);
    if max_instances < config.min_instances {
        return OfferVerdict::Reject("too few instances offered");
    }
    let max_class_instances = offer.class_instances.min(config.max_class_instances);
    if max_class_instances < config.min_class_instances {
        return OfferVerdict::Reject("too few class instances offered");
    }

    OfferVerdict::Accept(AcceptedTerms {
        service_type: config.service_type,
        max_instances,
        max_class_instances,
        keepalive_secs: config.keepalive_secs,
        max_resp_payload: config.max_resp_payload,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NegotiationState {
    AwaitingOffer,
    SendingAccept(AcceptedTerms),
    SendingReject,
}

/// What the I/O loop should do with a frame received while negotiating
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    Reply(FrameType, Bytes),
    Abort(&'static str),
}

/// Final outcome, reported once the reply has been written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Established(AcceptedTerms),
    Rejected,
}

#[derive(Debug)]
pub(crate) struct Negotiation {
    session_id: u32,
    state: NegotiationState,
    started: Instant,
}

impl Negotiation {
    /// Start waiting for an offer; the request-services frame is already queued.
    pub(crate) const fn new(session_id: u32, now: Instant) -> Self {
        Self {
            session_id,
            state: NegotiationState::AwaitingOffer,
            started: now,
        }
    }

    pub(crate) const fn started(&self) -> Instant {
        self.started
    }

    #[cfg(test)]
    pub(crate) const fn state(&self) -> NegotiationState {
        self.state
    }

    pub(crate) fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.started) >= timeout
    }

    pub(crate) fn on_frame(&mut self, registry: &Registry, frame: &Frame) -> Step {
        if self.state != NegotiationState::AwaitingOffer {
            return Step::Abort("frame received after the offer");
        }
        if frame.frame_type() != FrameType::OfferedService {
            return Step::Abort("expected an offered-service frame");
        }
        if frame.header.session_id != self.session_id {
            return Step::Abort("offer carries the wrong session id");
        }
        let Ok(offer) = OfferedService::decode(frame.payload.clone()) else {
            return Step::Abort("malformed offer");
        };

        match registry.reserve_session(&offer) {
            OfferVerdict::Accept(terms) => {
                debug!(
                    "[NEGOTIATE] Session {} accepted: type {} instances {} class instances {}",
                    self.session_id, terms.service_type, terms.max_instances, terms.max_class_instances
                );
                self.state = NegotiationState::SendingAccept(terms);
                let decision = ServiceDecision {
                    service_type: terms.service_type,
                };
                Step::Reply(FrameType::AcceptService, to_bytes(|b| decision.encode(b)))
            }
            OfferVerdict::Reject(reason) => {
                debug!(
                    "[NEGOTIATE] Session {} rejected ({}): {:?}",
                    self.session_id, reason, offer
                );
                self.state = NegotiationState::SendingReject;
                let decision = ServiceDecision {
                    service_type: ServiceType::UNDEFINED,
                };
                Step::Reply(FrameType::RejectService, to_bytes(|b| decision.encode(b)))
            }
            OfferVerdict::Abort(reason) => Step::Abort(reason),
        }
    }

    /// Called when every queued byte has been written.
    pub(crate) const fn on_write_complete(&self) -> Option<Outcome> {
        match self.state {
            NegotiationState::AwaitingOffer => None,
            NegotiationState::SendingAccept(terms) => Some(Outcome::Established(terms)),
            NegotiationState::SendingReject => Some(Outcome::Rejected),
        }
    }

    /// Give back an accept reservation held by a negotiation that died.
    pub(crate) fn abandon(&self, registry: &Registry) {
        if let NegotiationState::SendingAccept(terms) = self.state {
            registry.release_reservation(terms.service_type);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bks_wire::codec::FrameHeader;

    fn offer(ty: ServiceType, instances: u32, class_instances: u32) -> OfferedService {
        OfferedService {
            service_type: ty,
            service_instances: instances,
            class_instances,
            costing: instances,
            provider_version: 1,
        }
    }

    fn offer_frame(session_id: u32, offer: &OfferedService) -> Frame {
        let payload = to_bytes(|b| offer.encode(b));
        Frame {
            header: FrameHeader {
                frame_len: (12 + payload.len()) as u32,
                session_id,
                tx_seq: 1,
                rx_seq: 1,
                flags: 0,
                frame_type: FrameType::OfferedService,
            },
            payload,
        }
    }

    fn registry(max_sessions: u32) -> Registry {
        let registry = Registry::new();
        registry
            .register_type(
                ServiceConfig::new(ServiceType::ECHO)
                    .with_max_sessions(max_sessions)
                    .with_instances(2, 16)
                    .with_class_instances(0, 4),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_offer_is_clamped() {
        let config = ServiceConfig::new(ServiceType::ECHO)
            .with_instances(2, 16)
            .with_class_instances(0, 4);
        let verdict = evaluate_offer(&config, 0, &offer(ServiceType::ECHO, 100, 100));
        assert_eq!(
            verdict,
            OfferVerdict::Accept(AcceptedTerms {
                service_type: ServiceType::ECHO,
                max_instances: 16,
                max_class_instances: 4,
                keepalive_secs: 60,
                max_resp_payload: config.max_resp_payload,
            })
        );
    }

    #[test]
    fn test_offer_rejections() {
        let config = ServiceConfig::new(ServiceType::ECHO).with_instances(2, 16);
        assert!(matches!(
            evaluate_offer(&config, 0, &offer(ServiceType::ECHO, 1, 1)),
            OfferVerdict::Reject(_)
        ));
        assert!(matches!(
            evaluate_offer(&config, config.max_sessions, &offer(ServiceType::ECHO, 8, 8)),
            OfferVerdict::Reject(_)
        ));
        let mut old = offer(ServiceType::ECHO, 8, 8);
        old.provider_version = 0;
        assert!(matches!(evaluate_offer(&config, 0, &old), OfferVerdict::Reject(_)));
        assert!(matches!(
            evaluate_offer(&config, 0, &offer(ServiceType::SMITH_WATERMAN, 8, 8)),
            OfferVerdict::Abort(_)
        ));
    }

    #[test]
    fn test_accept_then_establish() {
        let registry = registry(1);
        let now = Instant::now();
        let mut negotiation = Negotiation::new(5, now);
        assert_eq!(negotiation.on_write_complete(), None);

        let step = negotiation.on_frame(&registry, &offer_frame(5, &offer(ServiceType::ECHO, 8, 2)));
        assert_eq!(
            step,
            Step::Reply(FrameType::AcceptService, Bytes::from_static(&[2]))
        );
        assert!(matches!(
            negotiation.on_write_complete(),
            Some(Outcome::Established(t)) if t.max_instances == 8 && t.max_class_instances == 2
        ));

        // The reservation counts against the type's cap.
        let mut second = Negotiation::new(6, now);
        let step = second.on_frame(&registry, &offer_frame(6, &offer(ServiceType::ECHO, 8, 2)));
        assert_eq!(
            step,
            Step::Reply(FrameType::RejectService, Bytes::from_static(&[0]))
        );
        assert_eq!(second.state(), NegotiationState::SendingReject);
        assert_eq!(second.on_write_complete(), Some(Outcome::Rejected));

        // Abandoning frees the reservation again.
        negotiation.abandon(&registry);
        let mut third = Negotiation::new(7, now);
        assert!(matches!(
            third.on_frame(&registry, &offer_frame(7, &offer(ServiceType::ECHO, 8, 2))),
            Step::Reply(FrameType::AcceptService, _)
        ));
    }

    #[test]
    fn test_unexpected_frames_abort() {
        let registry = registry(4);
        let now = Instant::now();

        let mut wrong_session = Negotiation::new(5, now);
        assert!(matches!(
            wrong_session.on_frame(&registry, &offer_frame(9, &offer(ServiceType::ECHO, 8, 2))),
            Step::Abort(_)
        ));

        let mut unknown_type = Negotiation::new(5, now);
        assert!(matches!(
            unknown_type.on_frame(&registry, &offer_frame(5, &offer(ServiceType(9), 8, 2))),
            Step::Abort(_)
        ));

        let mut wrong_frame = Negotiation::new(5, now);
        let mut frame = offer_frame(5, &offer(ServiceType::ECHO, 8, 2));
        frame.header.frame_type = FrameType::JobResponse;
        assert!(matches!(wrong_frame.on_frame(&registry, &frame), Step::Abort(_)));
    }

    #[test]
    fn test_expiry() {
        let now = Instant::now();
        let negotiation = Negotiation::new(1, now);
        assert!(!negotiation.is_expired(now, Duration::from_millis(200)));
        assert!(negotiation.is_expired(now + Duration::from_millis(200), Duration::from_millis(200)));
    }
}
