// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use canonical_error::{CanonicalError, deadline_exceeded_error, internal_error,
                      unavailable_error};
use log::{debug, warn};
use tonic::transport::Channel;

use crate::frame_dispatcher::FrameNotifier;
use crate::pipeline::NotifyFrameRequest;
use crate::pipeline::pipeline_client::PipelineClient;

/// Notifies the pipeline daemon over gRPC. Runs on the frame dispatcher's
/// worker thread, so it drives its own single-threaded runtime.
pub struct GrpcFrameNotifier {
    address: String,
    runtime: tokio::runtime::Runtime,
    // Dropped after any failure so that the next frame reconnects.
    client: Option<PipelineClient<Channel>>,
}

impl GrpcFrameNotifier {
    pub fn new(address: &str) -> Result<Self, CanonicalError> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()
            .map_err(|e| internal_error(&format!("Could not create runtime: {}", e)))?;
        Ok(GrpcFrameNotifier{address: address.to_string(), runtime, client: None})
    }
}

impl FrameNotifier for GrpcFrameNotifier {
    fn notify_frame(&mut self, camera_id: &str, filename: &str, timeout: Duration)
                    -> Result<(), CanonicalError> {
        let address = &self.address;
        let client_slot = &mut self.client;
        let request = NotifyFrameRequest{camera_id: camera_id.to_string(),
                                         filename: filename.to_string()};
        let result = self.runtime.block_on(async {
            tokio::time::timeout(timeout, async {
                let mut client = match client_slot.take() {
                    Some(client) => client,
                    None => PipelineClient::connect(address.clone()).await
                        .map_err(|e| unavailable_error(
                            &format!("Could not connect to pipeline at {}: {}",
                                     address, e)))?,
                };
                client.notify_frame(request).await.map_err(|e| {
                    internal_error(&format!("Pipeline rejected frame: {}", e.message()))
                })?;
                *client_slot = Some(client);
                Ok::<(), CanonicalError>(())
            }).await
        });
        match result {
            Ok(Ok(())) => {
                debug!("Pipeline notified of {}", filename);
                Ok(())
            },
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("Pipeline hand-off exceeded {:?}", timeout);
                Err(deadline_exceeded_error(
                    &format!("Pipeline did not accept {} within {:?}", filename, timeout)))
            },
        }
    }
}

// mod tests.
