pub mod capture;
pub mod config;
pub mod forward;
pub mod grpc;
pub mod logging;
pub mod metrics;
pub mod rest;
pub mod types;

pub mod proto_pcap {
    tonic::include_proto!("pcap.v1");
}

pub mod proto_streams {
    tonic::include_proto!("streams.v1");
}
