//! Buffer reconstruction ("fingertipping")
//!
//! When no tier holds a buffer, it can often be recomputed: rerun a
//! transformation known to produce it, or rebuild a semantic buffer from one
//! of its syntactic forms. Inputs of those transformations are fingertipped
//! in turn. Each checksum is tried at most once per request.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::checksum::{calculate_checksum, Buffer, Checksum};
use crate::codec::{serialize, Value};
use crate::error::{Result, SeamlessError};
use crate::execution::RunOptions;
use crate::logging::{operations, services, status};
use crate::service::{block_on, text_of, BoxFuture, CacheService, Lineage};

impl CacheService {
    /// Obtain a buffer, recomputing it if no tier has it
    pub async fn fingertip_async(&self, checksum: Checksum) -> Result<Buffer> {
        let mut tried = HashSet::new();
        let buffer = self.fingertip_inner(checksum, &mut tried).await?;
        info!(
            service = services::BUFFER_CACHE,
            operation = operations::FINGERTIP,
            status = status::SUCCESS,
            checksum = %checksum.short(),
            size_bytes = buffer.len(),
            "Buffer obtained"
        );
        Ok(buffer)
    }

    pub fn fingertip(&self, checksum: Checksum) -> Result<Buffer> {
        block_on("fingertip", self.fingertip_async(checksum))
    }

    fn fingertip_inner<'a>(
        &'a self,
        checksum: Checksum,
        tried: &'a mut HashSet<Checksum>,
    ) -> BoxFuture<'a, Result<Buffer>> {
        Box::pin(async move {
            // Without a way to regenerate it, a buffer on unreachable servers is a connection failure
            let unreachable = match self.inner.buffers.fetch_buffer(&checksum, true).await {
                Ok(Some(buffer)) => return Ok(buffer),
                Ok(None) => None,
                Err(SeamlessError::Connection { service }) => Some(service),
                Err(e) => return Err(e),
            };
            let miss = || match &unreachable {
                Some(service) => SeamlessError::Connection {
                    service: service.clone(),
                },
                None => SeamlessError::CacheMiss(checksum),
            };
            if !tried.insert(checksum) {
                return Err(miss());
            }

            for tf_checksum in self.producers(&checksum).await {
                match self.fingertip_transformation(tf_checksum, checksum, tried).await {
                    Ok(buffer) => return Ok(buffer),
                    Err(e) => debug!(
                        service = services::BUFFER_CACHE,
                        checksum = %checksum.short(),
                        transformation = %tf_checksum.short(),
                        error = %e,
                        "Producer could not regenerate buffer"
                    ),
                }
            }

            for (celltype, _, syntactic) in self.inner.semantic.syntactic_any(&checksum) {
                for candidate in syntactic {
                    let Ok(buffer) = self.fingertip_inner(candidate, tried).await else {
                        continue;
                    };
                    let source = text_of(&buffer, celltype)?;
                    let Some(canonical) = self.inner.runners.canonicalize(celltype, &source)? else {
                        continue;
                    };
                    let semantic = serialize(&Value::Text(canonical), celltype)?;
                    if calculate_checksum(&semantic) == checksum {
                        self.inner.buffers.cache_buffer(checksum, semantic.clone()).await;
                        return Ok(semantic);
                    }
                }
            }

            debug!(
                service = services::BUFFER_CACHE,
                operation = operations::FINGERTIP,
                status = status::MISS,
                checksum = %checksum.short(),
                "Buffer cannot be regenerated"
            );
            Err(miss())
        })
    }

    /// Transformations known to have produced `result`, from memory and the database
    async fn producers(&self, result: &Checksum) -> Vec<Checksum> {
        let mut producers = self.tc().producers_of(result);
        if let Some(database) = &self.inner.database {
            match database.get_rev_transformations(result).await {
                Ok(remote) => {
                    for tf in remote {
                        if !producers.contains(&tf) {
                            producers.push(tf);
                        }
                    }
                }
                Err(e) => warn!(service = services::DATABASE, error = %e, "Reverse lookup failed"),
            }
        }
        producers
    }

    /// Rerun one producer, after making sure its inputs are available
    async fn fingertip_transformation(
        &self,
        tf_checksum: Checksum,
        expected: Checksum,
        tried: &mut HashSet<Checksum>,
    ) -> Result<Buffer> {
        let transformation = self
            .get_transformation(&tf_checksum)
            .await?
            .ok_or(SeamlessError::CacheMiss(tf_checksum))?;

        let mut needed: Vec<(Checksum, Vec<Checksum>)> = Vec::new();
        for pin in transformation.pins.values() {
            let Some(checksum) = pin.checksum else {
                continue;
            };
            let candidates = self
                .syntactic_candidates(&checksum, pin.celltype, pin.subcelltype.as_deref())
                .await?;
            needed.push((checksum, candidates));
        }
        if let Some(env) = transformation.dunder.env {
            needed.push((env, vec![env]));
        }
        for (checksum, candidates) in needed {
            let mut available = false;
            for candidate in &candidates {
                if self.inner.buffers.has_buffer(candidate, true).await {
                    available = true;
                    break;
                }
            }
            if available {
                continue;
            }
            let mut regenerated = false;
            for candidate in candidates {
                if self.fingertip_inner(candidate, tried).await.is_ok() {
                    regenerated = true;
                    break;
                }
            }
            if !regenerated {
                return Err(SeamlessError::CacheMiss(checksum));
            }
        }

        let result = self
            .run_transformation_in(tf_checksum, None, RunOptions::fingertip(), Lineage::default())
            .await?;
        if result != expected {
            return Err(SeamlessError::ChecksumMismatch {
                expected,
                actual: result,
            });
        }
        self.inner
            .buffers
            .get_buffer(&expected, false)
            .await
            .ok_or(SeamlessError::CacheMiss(expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Celltype;
    use crate::runner::{RunContext, RunJob, RunnerRegistry};
    use crate::transformation::{OutputPin, TransformationDraft};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_forgotten_result_is_recomputed() {
        let runners = RunnerRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        runners.native().register("triple", move |job: &RunJob, _: &RunContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Json(json!(job.i64("a")? * 3)))
        });
        let service = CacheService::builder().runners(runners).build().unwrap();
        let draft = TransformationDraft::new("native", OutputPin::new("result", Celltype::Int))
            .code(Celltype::Text, "triple")
            .value("a", Celltype::Int, json!(4));

        let result = service
            .run_draft_async(draft, RunOptions { fingertip: false, scratch: true })
            .await
            .unwrap();
        service.buffer_cache().forget_buffer(&result);
        assert!(!service.buffer_cache().has_buffer(&result, true).await);

        let buffer = service.fingertip_async(result).await.unwrap();
        assert_eq!(&buffer[..], b"12\n");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_semantic_buffer_is_rebuilt_from_syntactic_form() {
        let service = CacheService::builder().build().unwrap();
        let source = "def f(x):\n    return x   # identity\n";
        let syntactic = service
            .cache_value(&Value::Text(source.into()), Celltype::Python)
            .await
            .unwrap();
        let semantic = service
            .syntactic_to_semantic(&syntactic, Celltype::Python, None)
            .await
            .unwrap();
        service.buffer_cache().forget_buffer(&semantic);

        let buffer = service.fingertip_async(semantic).await.unwrap();
        assert_eq!(calculate_checksum(&buffer), semantic);
    }

    #[tokio::test]
    async fn test_unknown_checksum_is_a_miss() {
        let service = CacheService::builder().build().unwrap();
        let checksum = calculate_checksum(b"nobody made this");
        let err = service.fingertip_async(checksum).await.unwrap_err();
        assert!(matches!(err, SeamlessError::CacheMiss(c) if c == checksum));
    }
}
