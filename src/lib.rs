// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod acquisition_engine;
pub mod artemis_sdk;
pub mod camd_service;
pub mod camera_controller;
pub mod camera_sdk;
pub mod config;
pub mod driver_gateway;
pub mod exposure_counter;
pub mod fits_writer;
pub mod frame;
pub mod frame_dispatcher;
pub mod pipeline_notifier;
pub mod sequence_signals;
pub mod sim_sdk;
pub mod status_poller;
pub mod trigger_stats;

pub mod camd {
    // The string specified here must match the proto package name.
    tonic::include_proto!("camd");
}
pub mod pipeline {
    tonic::include_proto!("pipeline");
}
