//! Response dispatch: hands replies from a pooled link back to their callers

use http::HeaderMap;
use std::sync::Arc;
use tokio::io::AsyncRead;

use crate::correlation::{CorrelationTable, RequestId};
use crate::endpoint::Endpoint;
use crate::error::{AgentError, AgentResult};
use crate::fatal::FatalSignal;
use crate::wire::{ProviderReply, ReplyDecoder, parse_request_id};

/// Reads replies off one provider link for the link's whole lifetime
pub struct ResponseDispatcher {
    index: usize,
    endpoint: Endpoint,
    table: Arc<CorrelationTable>,
}

impl ResponseDispatcher {
    pub fn new(index: usize, endpoint: Endpoint, table: Arc<CorrelationTable>) -> Self {
        Self {
            index,
            endpoint,
            table,
        }
    }

    /// Deliver one reply to the caller recorded under its correlation id
    pub fn dispatch(&self, reply: ProviderReply) -> AgentResult<RequestId> {
        let id = reply.request_id()?;
        let pending = self.table.take(id)?;
        crate::metrics::update_pending_requests(self.table.len());

        if pending.endpoint_index != self.index {
            tracing::warn!(
                request_id = id,
                sent_on = pending.endpoint_index,
                received_on = self.index,
                "Reply arrived on a different provider link than its request"
            );
        }

        let peer = pending.inbound.peer();
        pending.inbound.deliver(id, reply)?;

        tracing::debug!(
            request_id = id,
            endpoint = %self.endpoint,
            peer = ?peer,
            "Dispatched reply"
        );
        Ok(id)
    }

    /// Read and dispatch until the link fails.
    ///
    /// Per-reply problems are logged and skipped. End of stream, read errors
    /// and undecodable frames raise `fatal`: the link cannot be resynced.
    pub async fn run<R>(self, mut reader: R, max_reply_size: usize, fatal: FatalSignal)
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder = ReplyDecoder::new(max_reply_size);

        loop {
            loop {
                match decoder.decode_with(|headers| self.reply_has_body(headers)) {
                    Ok(Some(reply)) => self.handle(reply),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(endpoint = %self.endpoint, error = %e, "Undecodable reply from provider");
                        fatal.trigger(format!(
                            "undecodable reply from provider {}: {}",
                            self.endpoint, e
                        ));
                        return;
                    }
                }
            }

            match decoder.fill(&mut reader).await {
                Ok(0) => {
                    tracing::error!(
                        endpoint = %self.endpoint,
                        buffered = decoder.buffered(),
                        pending = self.table.len(),
                        "One connection to provider closed"
                    );
                    fatal.trigger(format!("provider {} closed the connection", self.endpoint));
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(endpoint = %self.endpoint, error = %e, "Read from provider failed");
                    fatal.trigger(format!("read from provider {} failed: {}", self.endpoint, e));
                    return;
                }
            }
        }
    }

    // Replies to HEAD requests end at their head; the table knows which ids those are
    fn reply_has_body(&self, headers: &HeaderMap) -> bool {
        match parse_request_id(headers) {
            Ok(id) => self.table.expects_reply_body(id),
            Err(_) => true,
        }
    }

    fn handle(&self, reply: ProviderReply) {
        match self.dispatch(reply) {
            Ok(_) => crate::metrics::record_reply_dispatched(),
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "Dropping reply");
                crate::metrics::record_reply_dropped(drop_reason(&e));
            }
        }
    }
}

fn drop_reason(err: &AgentError) -> &'static str {
    match err {
        AgentError::MissingRequestId => "missing_id",
        AgentError::MalformedRequestId(_) => "malformed_id",
        AgentError::UnknownRequestId(_) => "unknown_id",
        AgentError::InboundClosed(_) => "caller_gone",
        _ => "other",
    }
}
