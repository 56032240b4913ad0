pub mod cache;
pub mod errors;
pub mod extend;
pub mod fastq; // read source: FASTQ/FASTA with gzip and quality normalization
pub mod index; // FM-style forward/reverse indexes and coordinate resolution
pub mod metrics;
pub mod opts;
pub mod output;
pub mod pe;
pub mod random;
pub mod read;
pub mod scoring;
pub mod seed;
pub mod seed_search;
pub mod simd; // 128-bit engine shared by the DP kernels
pub mod simple_func;
pub mod sink;
pub mod swa;
pub mod walk;
pub mod worker;
