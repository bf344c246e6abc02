// Module Definition
pub mod accessor; // Affine point-to-address mapping
pub mod args; // Kernel argument blocks
pub mod controller; // Host runtime: regions, copies, launches
pub mod element;
pub mod geometry;
pub mod io;
pub mod kernels; // Lane kernels and launch validation
pub mod lane;
pub mod memory; // Bulk memory, regions and scratchpad
pub mod node;
pub mod partition;
pub mod staging;
pub mod workloads;
