use tokio::select;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};
use crate::connection::{Connection, Outbound};
use crate::error::ConnError;

impl Connection {
    /// Drains the outbound queue and sends keepalive PINGs, and resends overdue pending frames
    ///  if retransmission is configured.
    ///
    /// The loop terminates cleanly when the outbound queue is closed, i.e. when the connection
    ///  is closed. A write error terminates it and is returned.
    pub async fn write_loop(&self) -> Result<(), ConnError> {
        let Some(mut outbound) = self.outbound_receiver.lock().await.take() else {
            if self.is_closed() {
                debug!("connection to {:?} is closed - not starting write loop", self.peer_addr());
            }
            else {
                warn!("write loop for {:?} was started before - not starting again", self.peer_addr());
            }
            return Ok(());
        };

        let keepalive_interval = self.config.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + keepalive_interval, keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let retransmit_enabled = self.config.retransmit.is_some();
        let mut retransmit = interval(self.config.retransmit.as_ref()
            .map(|r| r.check_interval)
            .unwrap_or(keepalive_interval));
        retransmit.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!("starting write loop for {:?}", self.peer_addr());
        loop {
            let result = select! {
                _ = keepalive.tick() => {
                    trace!("sending keepalive PING to {:?}", self.peer_addr());
                    self.ping().await
                }
                _ = retransmit.tick(), if retransmit_enabled => {
                    self.resend_overdue().await
                }
                item = outbound.recv() => {
                    let Some(item) = item else {
                        debug!("outbound queue for {:?} closed - terminating write loop", self.peer_addr());
                        return Ok(());
                    };
                    trace!("msg out to {:?}: {:?}", self.peer_addr(), item);
                    match item {
                        Outbound::Single(payload) => self.send(payload).await.map(|_| ()),
                        Outbound::Fragments(fragments) => self.send_fragments(&fragments).await.map(|_| ()),
                    }
                }
            };

            match result {
                Ok(()) => {}
                Err(ConnError::ConnectionClosed) => {
                    debug!("connection to {:?} closed - terminating write loop", self.peer_addr());
                    return Ok(());
                }
                Err(e) => {
                    error!("write to {:?} failed: {}", self.peer_addr(), e);
                    return Err(e);
                }
            }

            if self.is_closed() {
                debug!("connection to {:?} closed - terminating write loop", self.peer_addr());
                return Ok(());
            }
        }
    }
}
