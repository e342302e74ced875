//! Collaborators shared by every call and peer of one provider

use std::sync::Arc;

use crate::config::CallCoreConfig;
use crate::dtmf::DtmfDispatcher;
use crate::events::{CoreEvent, EventSink};
use crate::media::MediaEngine;
use crate::sdp::{Negotiator, SdpCodec};
use crate::signaling::SignalingTransport;
use crate::types::ProviderId;

pub(crate) struct CoreContext {
    pub provider_id: ProviderId,
    pub config: CallCoreConfig,
    pub transport: Arc<dyn SignalingTransport>,
    pub media: Arc<dyn MediaEngine>,
    pub negotiator: Negotiator,
    pub events: Arc<dyn EventSink>,
    pub dtmf: DtmfDispatcher,
}

impl CoreContext {
    pub fn new(
        config: CallCoreConfig,
        transport: Arc<dyn SignalingTransport>,
        media: Arc<dyn MediaEngine>,
        codec: Arc<dyn SdpCodec>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let provider_id = ProviderId::new();
        let negotiator = Negotiator::new(&config, codec, media.clone());
        let dtmf = DtmfDispatcher::new(provider_id, config.dtmf.clone(), transport.clone(), media.clone());
        Self {
            provider_id,
            config,
            transport,
            media,
            negotiator,
            events,
            dtmf,
        }
    }

    pub fn publish(&self, event: CoreEvent) {
        self.events.publish(event);
    }
}
