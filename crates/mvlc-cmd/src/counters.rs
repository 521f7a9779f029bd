use serde::Serialize;

/// Command pipe reader statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CmdPipeCounters {
    pub reads: u64,
    pub bytes_read: u64,
    pub timeouts: u64,
    /// Reads that failed with something other than a timeout.
    pub read_errors: u64,
    /// Words at a frame boundary that were not a super, stack or error header.
    pub invalid_headers: u64,
    pub words_skipped: u64,
    pub error_buffers: u64,
    pub super_buffers: u64,
    pub stack_buffers: u64,
    pub short_super_buffers: u64,
    pub super_format_errors: u64,
    pub super_ref_mismatches: u64,
    pub stack_ref_mismatches: u64,
    /// ETH only.
    pub lost_packets: u64,
}
