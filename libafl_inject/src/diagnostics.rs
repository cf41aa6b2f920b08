//! JSON lines diagnostics for targeted calls.
//!
//! The debug output of the instrumentation framework silently truncates long single writes, so
//! every record is written in chunks of at most [`JSONL_CHUNK_SIZE`] bytes and terminated by one
//! newline.

use std::io::Write;

use serde::Serialize;

use crate::{
    engine::{CallInfo, Decision, DescriptorId},
    function::Function,
    Error,
};

/// Largest single write handed to the underlying writer.
pub const JSONL_CHUNK_SIZE: usize = 1024;

/// Serializes `value` as one json line, written in bounded chunks.
pub fn write_jsonl<W, T>(writer: &mut W, value: &T) -> Result<(), Error>
where
    W: Write,
    T: Serialize + ?Sized,
{
    let line = serde_json::to_vec(value)?;
    for chunk in line.chunks(JSONL_CHUNK_SIZE) {
        writer.write_all(chunk)?;
    }
    writer.write_all(b"\n")?;
    Ok(())
}

/// What the harness logs about a call it decided to corrupt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetedCall {
    /// The called function
    pub func_name: Function,
    /// Occurrence index of the call
    pub index: u64,
    /// Masked return address
    pub ret_addr_offset: u64,
    /// Occurrence index at the return address
    pub ret_addr_count: u64,
    /// Argument hash of the call, empty if it was not hashed
    pub arg_hash: String,
    /// Stream position
    pub position: u64,
    /// Bytes requested
    pub requested_size: u64,
    /// Bytes read
    pub actual_size: u64,
    /// The descriptor that matched
    pub descriptor: Option<DescriptorId>,
}

impl TargetedCall {
    /// Builds the record for an evaluated call.
    #[must_use]
    pub fn new(call: &CallInfo, decision: &Decision, aslr_mask: u64) -> Self {
        Self {
            func_name: call.function,
            index: decision.occurrence,
            ret_addr_offset: call.ret_addr_offset & aslr_mask,
            ret_addr_count: decision.ret_addr_occurrence,
            arg_hash: decision.arg_hash_hex(),
            position: call.position,
            requested_size: call.requested_size,
            actual_size: call.actual_size,
            descriptor: decision.matched,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Write};

    use serde_json::json;

    use super::{write_jsonl, TargetedCall, JSONL_CHUNK_SIZE};
    use crate::{
        descriptor::MATCH_INDEX,
        engine::{CallInfo, MatchEngine},
        function::Function,
    };

    /// Records the size of every write, like a truncating debug console would see them.
    #[derive(Debug, Default)]
    struct ChunkRecorder {
        writes: Vec<usize>,
        data: Vec<u8>,
    }

    impl Write for ChunkRecorder {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes.push(buf.len());
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_jsonl_chunks() {
        let payload = json!({ "blob": "x".repeat(3000) });
        let mut out = ChunkRecorder::default();
        write_jsonl(&mut out, &payload).unwrap();

        assert!(out.writes.iter().all(|len| *len <= JSONL_CHUNK_SIZE));
        assert_eq!(out.data.last(), Some(&b'\n'));
        let line = &out.data[..out.data.len() - 1];
        assert!(!line.contains(&b'\n'));
        let parsed: serde_json::Value = serde_json::from_slice(line).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_targeted_call_record() {
        let engine = MatchEngine::default();
        let targets = json!([{
            "selected": true,
            "index": 0,
            "mode": MATCH_INDEX,
            "retAddrOffset": 0,
            "retAddrCount": 0,
            "functionName": "recv",
        }]);
        assert!(engine.load_targets(&targets.to_string()));

        let call = CallInfo {
            module: Some("ws2_32.dll"),
            ret_addr_offset: 0x7ff6_0000_0abc,
            requested_size: 512,
            actual_size: 100,
            ..CallInfo::new(Function::Recv)
        };
        let decision = engine.evaluate(&call);
        assert!(decision.targeted);

        let record = TargetedCall::new(&call, &decision, engine.config().aslr_mask);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["func_name"], "recv");
        assert_eq!(value["ret_addr_offset"], 0xabc);
        assert_eq!(value["descriptor"]["position"], 0);
        assert_eq!(value["arg_hash"], decision.arg_hash_hex());
        assert_eq!(value["arg_hash"].as_str().map(str::len), Some(32));
    }
}
