//! Criterion benchmarks for the Sentinel handshake path live under `benches/`.
