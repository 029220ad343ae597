/// CSR field layout and packing.
pub mod csr;
/// I/O write buffer merging.
pub mod iowb;
