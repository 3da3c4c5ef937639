//! File transfer: offers, chunked delivery, order-independent reassembly.
//!
//! An offer announces filename/size/type under a fresh 4-byte hex FILEID;
//! chunks follow as base64 DATA fields of at most 1024 raw bytes each,
//! keyed by a 0-based CHUNK_INDEX. The receiver stores chunks in a map, so
//! arrival order is irrelevant; reassembly walks index 0..N-1 and refuses
//! to produce anything while a gap remains. Whether to accept an offer is
//! a purely local decision — nothing about it goes on the wire, and chunks
//! for rejected or unknown ids are dropped without a reply.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// MIME type from the file extension. The short table covers what LSNP
/// peers actually exchange; everything else is an octet stream.
pub fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("txt") => "text/plain",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

/// Strip any path components a peer smuggled into FILENAME.
pub fn sanitize_filename(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .unwrap_or("download.bin")
        .to_string()
}

/// A transfer this node is sending. Chunks go out immediately after the
/// offer; the record stays around until FILE_RECEIVED closes it out.
#[derive(Debug, Clone)]
pub struct OutboundTransfer {
    pub file_id: String,
    pub to: String,
    pub filename: String,
    pub filesize: u64,
    pub total_chunks: u32,
}

/// A transfer this node is receiving. `accepted` is `None` until the local
/// user decides; chunks racing the decision are buffered, and a rejection
/// throws them away along with everything that follows.
#[derive(Debug)]
pub struct InboundTransfer {
    pub file_id: String,
    pub from: String,
    pub filename: String,
    pub filesize: u64,
    pub filetype: String,
    pub accepted: Option<bool>,
    pub total_chunks: Option<u32>,
    chunks: HashMap<u32, Vec<u8>>,
}

impl InboundTransfer {
    pub fn new(
        file_id: String,
        from: String,
        filename: String,
        filesize: u64,
        filetype: String,
    ) -> Self {
        Self {
            file_id,
            from,
            filename: sanitize_filename(&filename),
            filesize,
            filetype,
            accepted: None,
            total_chunks: None,
            chunks: HashMap::new(),
        }
    }

    /// Store one chunk. Returns false for duplicates. The first chunk pins
    /// TOTAL_CHUNKS; later chunks claiming a different total are dropped.
    pub fn store_chunk(&mut self, index: u32, total: u32, data: Vec<u8>) -> bool {
        match self.total_chunks {
            None => self.total_chunks = Some(total),
            Some(t) if t != total => {
                debug!("chunk for {} disagrees on total ({t} vs {total})", self.file_id);
                return false;
            }
            Some(_) => {}
        }
        if index >= total || self.chunks.contains_key(&index) {
            return false;
        }
        self.chunks.insert(index, data);
        true
    }

    pub fn received_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Complete iff every index 0..TOTAL_CHUNKS has arrived.
    pub fn is_complete(&self) -> bool {
        match self.total_chunks {
            Some(total) => self.chunks.len() as u32 == total,
            None => false,
        }
    }

    /// Concatenate chunks in strict index order. `None` while any index is
    /// missing.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        let total = self.total_chunks?;
        let mut out = Vec::with_capacity(self.filesize as usize);
        for index in 0..total {
            out.extend_from_slice(self.chunks.get(&index)?);
        }
        Some(out)
    }
}

/// Process-wide open transfers, both directions.
pub struct TransferTable {
    inbound: Mutex<HashMap<String, InboundTransfer>>,
    outbound: Mutex<HashMap<String, OutboundTransfer>>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self {
            inbound: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
        }
    }

    /// Record a fresh inbound offer. A duplicate FILEID keeps the original
    /// record (and its buffered chunks).
    pub fn offer_inbound(&self, transfer: InboundTransfer) -> bool {
        let mut inbound = self.inbound.lock().unwrap();
        if inbound.contains_key(&transfer.file_id) {
            return false;
        }
        inbound.insert(transfer.file_id.clone(), transfer);
        true
    }

    pub fn with_inbound<R>(
        &self,
        file_id: &str,
        f: impl FnOnce(&mut InboundTransfer) -> R,
    ) -> Option<R> {
        self.inbound.lock().unwrap().get_mut(file_id).map(f)
    }

    /// Flip the accept decision. Returns `None` for unknown ids, otherwise
    /// whether the transfer is already complete and ready to assemble.
    pub fn decide_inbound(&self, file_id: &str, accept: bool) -> Option<bool> {
        let mut inbound = self.inbound.lock().unwrap();
        let transfer = inbound.get_mut(file_id)?;
        transfer.accepted = Some(accept);
        if !accept {
            transfer.chunks.clear();
        }
        Some(transfer.is_complete())
    }

    pub fn remove_inbound(&self, file_id: &str) -> Option<InboundTransfer> {
        self.inbound.lock().unwrap().remove(file_id)
    }

    pub fn start_outbound(&self, transfer: OutboundTransfer) {
        self.outbound
            .lock()
            .unwrap()
            .insert(transfer.file_id.clone(), transfer);
    }

    pub fn finish_outbound(&self, file_id: &str) -> Option<OutboundTransfer> {
        self.outbound.lock().unwrap().remove(file_id)
    }

    pub fn open_counts(&self) -> (usize, usize) {
        (
            self.inbound.lock().unwrap().len(),
            self.outbound.lock().unwrap().len(),
        )
    }
}

impl Default for TransferTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Write an assembled file under `dir`, creating it as needed.
pub fn write_received_file(dir: &Path, filename: &str, data: &[u8]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(sanitize_filename(filename));
    std::fs::write(&path, data)?;
    Ok(path)
}
