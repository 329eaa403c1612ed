use crate::client::E4Client;
use crate::error::{ClientError, Result};
use crate::protocol::StreamSample;
use crate::stream::StreamId;
use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use std::collections::BTreeSet;

/// A device attached to a client session.
///
/// Dropping the handle unsubscribes every active stream and disconnects the
/// device, logging any failure. Use [`DeviceConnection::disconnect`] to get
/// those failures back instead.
pub struct DeviceConnection<'a> {
    client: &'a E4Client,
    device: String,
    active: BTreeSet<StreamId>,
    torn_down: bool,
}

impl<'a> DeviceConnection<'a> {
    pub(crate) fn new(client: &'a E4Client, device: String) -> Self {
        Self {
            client,
            device,
            active: BTreeSet::new(),
            torn_down: false,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn client(&self) -> &'a E4Client {
        self.client
    }

    pub fn subscribe_to_stream(&mut self, stream: StreamId) -> Result<Receiver<StreamSample>> {
        let receiver = self.client.subscribe_to_stream(stream)?;
        self.active.insert(stream);
        Ok(receiver)
    }

    /// Unsubscribe `stream`. A paired stream shares the server subscription
    /// and stops with it.
    pub fn unsubscribe_from_stream(&mut self, stream: StreamId) -> Result<()> {
        self.client.unsubscribe_from_stream(stream)?;
        self.active.remove(&stream);
        if let Some(paired) = stream.paired_stream() {
            if self.active.remove(&paired) {
                debug!("{} stopped together with {}", paired, stream);
            }
        }
        Ok(())
    }

    /// Streams subscribed through this handle, in stream table order
    pub fn active_streams(&self) -> Vec<StreamId> {
        self.active.iter().copied().collect()
    }

    /// Unsubscribe everything and disconnect the device.
    ///
    /// Every step is attempted even after a failure. All failures are
    /// returned together as `ClientError::Teardown`.
    pub fn disconnect(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        self.torn_down = true;
        let mut failures = Vec::new();
        let mut released: Vec<StreamId> = Vec::new();

        for stream in std::mem::take(&mut self.active) {
            if released.iter().any(|r| r.shares_subscription_with(stream)) {
                continue;
            }
            match self.client.unsubscribe_from_stream(stream) {
                Ok(()) => released.push(stream),
                Err(e) => {
                    warn!("⚠️ Failed to unsubscribe {} from {}: {}", stream, self.device, e);
                    failures.push(e);
                }
            }
        }

        match self.client.disconnect_from_device() {
            Ok(()) => {}
            Err(e) => {
                warn!("⚠️ Failed to disconnect device {}: {}", self.device, e);
                failures.push(e);
            }
        }

        if failures.is_empty() {
            info!("✅ Device {} torn down", self.device);
            Ok(())
        } else {
            Err(ClientError::Teardown {
                device: self.device.clone(),
                failures,
            })
        }
    }
}

impl Drop for DeviceConnection<'_> {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        if let Err(e) = self.teardown() {
            error!("❌ {}", e);
            if let ClientError::Teardown { failures, .. } = &e {
                for failure in failures {
                    error!("   - {}", failure);
                }
            }
        }
    }
}

impl std::fmt::Debug for DeviceConnection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("device", &self.device)
            .field("active", &self.active)
            .finish()
    }
}
