// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use log::warn;

use crate::camd::camd_server::Camd;
use crate::camd::{CommandResult, CommandStatus, ConfigureRequest, EmptyMessage,
                  ExposureRequest, SequenceRequest, StatusReport, TemperatureRequest};
use crate::camera_controller::CameraController;

/// gRPC front end for the camera controller. Commands are only accepted
/// from the configured control machines; status reports are served to
/// anyone.
pub struct CamdService {
    controller: Arc<CameraController>,
    control_machines: Vec<IpAddr>,
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

impl CamdService {
    pub fn new(controller: Arc<CameraController>, control_machines: Vec<IpAddr>) -> Self {
        CamdService{controller, control_machines}
    }

    fn is_control_origin(&self, remote: Option<SocketAddr>) -> bool {
        match remote {
            Some(addr) => {
                let ip = canonical_ip(addr.ip());
                self.control_machines.iter().any(|m| canonical_ip(*m) == ip)
            },
            None => false,
        }
    }

    // Runs `command` on the blocking pool, as controller commands make
    // native driver calls and may join threads.
    async fn run_command<F>(&self, remote: Option<SocketAddr>, command: F)
                            -> Result<tonic::Response<CommandResult>, tonic::Status>
    where F: FnOnce(&CameraController) -> CommandStatus + Send + 'static
    {
        if !self.is_control_origin(remote) {
            warn!("Rejected command from unauthorized origin {:?}", remote);
            return Ok(tonic::Response::new(
                CommandResult{status: CommandStatus::Unauthorized as i32}));
        }
        let controller = self.controller.clone();
        let status = tokio::task::spawn_blocking(move || command(controller.as_ref())).await
            .map_err(|e| tonic::Status::internal(format!("Command failed: {}", e)))?;
        Ok(tonic::Response::new(CommandResult{status: status as i32}))
    }
}

#[tonic::async_trait]
impl Camd for CamdService {
    async fn initialize(&self, request: tonic::Request<EmptyMessage>)
                        -> Result<tonic::Response<CommandResult>, tonic::Status> {
        self.run_command(request.remote_addr(), |c| c.initialize()).await
    }

    async fn shutdown(&self, request: tonic::Request<EmptyMessage>)
                      -> Result<tonic::Response<CommandResult>, tonic::Status> {
        self.run_command(request.remote_addr(), |c| c.shutdown()).await
    }

    async fn configure(&self, request: tonic::Request<ConfigureRequest>)
                       -> Result<tonic::Response<CommandResult>, tonic::Status> {
        let remote = request.remote_addr();
        let req = request.into_inner();
        self.run_command(remote, move |c| c.configure(req.temperature, req.exposure)).await
    }

    async fn set_exposure(&self, request: tonic::Request<ExposureRequest>)
                          -> Result<tonic::Response<CommandResult>, tonic::Status> {
        let remote = request.remote_addr();
        let seconds = request.into_inner().seconds;
        self.run_command(remote, move |c| c.set_exposure(seconds)).await
    }

    async fn set_target_temperature(&self, request: tonic::Request<TemperatureRequest>)
                                    -> Result<tonic::Response<CommandResult>, tonic::Status> {
        let remote = request.remote_addr();
        let temperature = request.into_inner().temperature;
        self.run_command(remote, move |c| c.set_target_temperature(temperature)).await
    }

    async fn start_sequence(&self, request: tonic::Request<SequenceRequest>)
                            -> Result<tonic::Response<CommandResult>, tonic::Status> {
        let remote = request.remote_addr();
        let count = request.into_inner().count;
        self.run_command(remote, move |c| c.start_sequence(count)).await
    }

    async fn stop_sequence(&self, request: tonic::Request<EmptyMessage>)
                           -> Result<tonic::Response<CommandResult>, tonic::Status> {
        self.run_command(request.remote_addr(), |c| c.stop_sequence()).await
    }

    async fn report_status(&self, _request: tonic::Request<EmptyMessage>)
                           -> Result<tonic::Response<StatusReport>, tonic::Status> {
        let controller = self.controller.clone();
        let report = tokio::task::spawn_blocking(move || controller.report_status()).await
            .map_err(|e| tonic::Status::internal(format!("Status failed: {}", e)))?;
        Ok(tonic::Response::new(report))
    }
}

// mod tests.
