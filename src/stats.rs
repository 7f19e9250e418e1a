//! Stats snapshot and sink callback.

/// Per-class hit counters, aggregated from the embedding cache's
/// thread-local stats (out of scope here — supplied by the caller).
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassHitCounters {
    pub get_hits: u64,
    pub cmd_set: u64,
    pub delete_hits: u64,
    pub incr_hits: u64,
    pub decr_hits: u64,
    pub cas_hits: u64,
    pub cas_badval: u64,
    pub touch_hits: u64,
}

/// One class's row of `slabs_stats` output.
#[derive(Debug, Clone, Copy)]
pub struct ClassStats {
    pub class_id: u32,
    pub chunk_size: u32,
    pub chunks_per_page: u32,
    pub total_pages: u32,
    pub total_chunks: u64,
    pub used_chunks: u64,
    pub free_chunks: u32,
    pub mem_requested: u64,
    pub hits: ClassHitCounters,
}

/// Global counters reported alongside the per-class rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalStats {
    pub active_slabs: u32,
    pub total_malloced: u64,
    pub slabs_moved: u64,
    pub slabs_shrunk: u64,
}

/// Callback-style stats sink, standing in for the C API's `add_stat`. A real embedder might
/// implement this over a text or binary protocol response buffer; the
/// "terminator is one call with NULL key" convention of the C API becomes
/// simply "no explicit terminator call" here, since Rust iteration has a
/// natural end.
pub trait StatsSink {
    fn add_stat(&mut self, key: &str, value: &str);
}

impl StatsSink for Vec<(String, String)> {
    fn add_stat(&mut self, key: &str, value: &str) {
        self.push((key.to_string(), value.to_string()));
    }
}

/// Emit one class's stats as `(key, value)` pairs through `sink`, in the
/// same key names as `do_slabs_stats`'s `APPEND_NUM_STAT` calls.
pub fn emit_class_stats(sink: &mut dyn StatsSink, stats: &ClassStats) {
    let id = stats.class_id;
    sink.add_stat(&format!("{id}:chunk_size"), &stats.chunk_size.to_string());
    sink.add_stat(&format!("{id}:chunks_per_page"), &stats.chunks_per_page.to_string());
    sink.add_stat(&format!("{id}:total_pages"), &stats.total_pages.to_string());
    sink.add_stat(&format!("{id}:total_chunks"), &stats.total_chunks.to_string());
    sink.add_stat(&format!("{id}:used_chunks"), &stats.used_chunks.to_string());
    sink.add_stat(&format!("{id}:free_chunks"), &stats.free_chunks.to_string());
    sink.add_stat(&format!("{id}:mem_requested"), &stats.mem_requested.to_string());
    sink.add_stat(&format!("{id}:get_hits"), &stats.hits.get_hits.to_string());
    sink.add_stat(&format!("{id}:cmd_set"), &stats.hits.cmd_set.to_string());
    sink.add_stat(&format!("{id}:delete_hits"), &stats.hits.delete_hits.to_string());
    sink.add_stat(&format!("{id}:incr_hits"), &stats.hits.incr_hits.to_string());
    sink.add_stat(&format!("{id}:decr_hits"), &stats.hits.decr_hits.to_string());
    sink.add_stat(&format!("{id}:cas_hits"), &stats.hits.cas_hits.to_string());
    sink.add_stat(&format!("{id}:cas_badval"), &stats.hits.cas_badval.to_string());
    sink.add_stat(&format!("{id}:touch_hits"), &stats.hits.touch_hits.to_string());
}

pub fn emit_global_stats(sink: &mut dyn StatsSink, stats: &GlobalStats) {
    sink.add_stat("active_slabs", &stats.active_slabs.to_string());
    sink.add_stat("total_malloced", &stats.total_malloced.to_string());
    sink.add_stat("slabs_moved", &stats.slabs_moved.to_string());
    sink.add_stat("slabs_shrunk", &stats.slabs_shrunk.to_string());
}
