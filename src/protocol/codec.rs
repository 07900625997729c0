use serde::{Deserialize, Serialize};

use crate::payload::{Payload, PayloadError, PayloadRegistry, SerializedPayload};
use crate::scheduler::job::LarvalJob;

#[derive(Serialize, Deserialize)]
struct JobAndResult {
    job: LarvalJob,
    result: SerializedPayload,
}

/// Byte format of a job result travelling with the job that produced it.
///
/// Every node must agree on `compress`, since the bytes carry no marker.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultCodec {
    compress: bool,
}

impl ResultCodec {
    pub fn new(compress: bool) -> Self {
        Self { compress }
    }

    pub fn compresses(&self) -> bool {
        self.compress
    }

    pub fn encode(&self, job: &LarvalJob, result: &dyn Payload) -> Result<Vec<u8>, PayloadError> {
        let envelope = JobAndResult {
            job: job.clone(),
            result: SerializedPayload::encode(result)?,
        };
        let bytes = bincode::serialize(&envelope).map_err(PayloadError::Encode)?;
        if self.compress {
            // Level 0 selects zstd's default level.
            zstd::encode_all(bytes.as_slice(), 0).map_err(PayloadError::Compression)
        } else {
            Ok(bytes)
        }
    }

    pub fn decode(
        &self,
        registry: &PayloadRegistry,
        bytes: &[u8],
    ) -> Result<(LarvalJob, Box<dyn Payload>), PayloadError> {
        let inflated;
        let bytes = if self.compress {
            inflated = zstd::decode_all(bytes).map_err(PayloadError::Compression)?;
            inflated.as_slice()
        } else {
            bytes
        };
        let envelope: JobAndResult =
            bincode::deserialize(bytes).map_err(|source| PayloadError::Decode {
                what: "job and result".to_string(),
                source,
            })?;
        let result = registry.decode(&envelope.result)?;
        Ok((envelope.job, result))
    }
}

pub fn encode_larval_job(job: &LarvalJob) -> Result<Vec<u8>, PayloadError> {
    bincode::serialize(job).map_err(PayloadError::Encode)
}

pub fn decode_larval_job(bytes: &[u8]) -> Result<LarvalJob, PayloadError> {
    bincode::deserialize(bytes).map_err(|source| PayloadError::Decode {
        what: "larval job".to_string(),
        source,
    })
}

/// Encode a list of payloads (job summaries, deallocation messages).
pub fn encode_payloads(payloads: &[&dyn Payload]) -> Result<Vec<u8>, PayloadError> {
    let tagged = payloads
        .iter()
        .map(|payload| SerializedPayload::encode(*payload))
        .collect::<Result<Vec<_>, _>>()?;
    bincode::serialize(&tagged).map_err(PayloadError::Encode)
}

pub fn decode_payloads(
    registry: &PayloadRegistry,
    bytes: &[u8],
) -> Result<Vec<Box<dyn Payload>>, PayloadError> {
    let tagged: Vec<SerializedPayload> =
        bincode::deserialize(bytes).map_err(|source| PayloadError::Decode {
            what: "payload list".to_string(),
            source,
        })?;
    tagged.iter().map(|payload| registry.decode(payload)).collect()
}
