//! The mirror's client session state machine.
//!
//! A session moves Await-Params → Serving → Closed. The first message must
//! be `P`; afterwards each request produces exactly one reply, except in
//! batch mode where `X`/`C`/`R`/`M` replies are deferred through the
//! batch-answer task. Protocol violations answer a human-readable error
//! string and close only the offending session; the accept loop stays up.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use raidpir_core::bits::{self, ChunkGeometry};
use raidpir_core::codec;
use raidpir_core::params::SessionParams;
use raidpir_core::prg::SeedStream;
use raidpir_core::wire::{self, ChunkMap, MirrorRequest, WireError};
use raidpir_store::XorDatastore;

use crate::batch::BatchHandle;

pub struct MirrorService {
    store: Arc<XorDatastore>,
}

/// A protocol violation: the message is sent to the client, then the
/// session closes.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Violation(String);

impl From<&str> for Violation {
    fn from(message: &str) -> Self {
        Violation(message.to_string())
    }
}

struct Session {
    params: SessionParams,
    geometry: Option<ChunkGeometry>,
    stream: Option<SeedStream>,
    batch: Option<BatchHandle>,
    compute_time: Arc<Mutex<f64>>,
}

/// How a request was answered.
enum Disposition {
    Reply(Vec<u8>),
    /// Batch mode: the batch task will reply later, in order.
    Deferred,
}

impl MirrorService {
    pub fn new(store: XorDatastore) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::new(store),
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.store.num_blocks()
    }

    /// Accept loop: one task per client session.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let service = self.clone();
                    tokio::spawn(async move {
                        tracing::debug!(%peer, "session opened");
                        let (reader, writer) = stream.into_split();
                        match service.handle_session(reader, writer).await {
                            Ok(()) => tracing::debug!(%peer, "session closed"),
                            Err(err) => {
                                tracing::warn!(%peer, error = %err, "session ended with error")
                            }
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                }
            }
        }
    }

    /// Drive one session to completion. Generic over the transport so tests
    /// can run sessions over in-memory pipes.
    pub async fn handle_session<R, W>(
        self: Arc<Self>,
        mut reader: R,
        writer: W,
    ) -> Result<(), WireError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = Arc::new(Mutex::new(writer));
        let mut session: Option<Session> = None;

        let result = loop {
            let raw = match wire::recv_message(&mut reader).await {
                Ok(raw) => raw,
                Err(WireError::PeerClosed) => break Ok(()),
                Err(err) => break Err(err),
            };

            let request = match MirrorRequest::parse(&raw) {
                Ok(request) => request,
                Err(err) => {
                    break self
                        .send_error(&writer, &format!("Invalid request type: {err}"))
                        .await;
                }
            };

            match request {
                MirrorRequest::Quit => break Ok(()),
                MirrorRequest::Params(params) => {
                    match self.open_session(params, writer.clone()).await {
                        Ok(fresh) => {
                            // renegotiation drains the previous batch task first
                            if let Some(old) = session.replace(fresh) {
                                if let Some(batch) = old.batch {
                                    batch.shutdown().await;
                                }
                            }
                            let mut w = writer.lock().await;
                            if let Err(err) = wire::send_message(&mut *w, wire::PARAMS_OK).await {
                                break Err(err);
                            }
                        }
                        Err(violation) => {
                            break self.send_error(&writer, &violation.to_string()).await
                        }
                    }
                }
                request => {
                    let Some(active) = session.as_mut() else {
                        break self
                            .send_error(&writer, "first message must be session parameters")
                            .await;
                    };
                    match self.handle_request(active, request).await {
                        Ok(Disposition::Reply(reply)) => {
                            let mut w = writer.lock().await;
                            if let Err(err) = wire::send_message(&mut *w, &reply).await {
                                break Err(err);
                            }
                        }
                        Ok(Disposition::Deferred) => {}
                        Err(violation) => {
                            break self.send_error(&writer, &violation.to_string()).await
                        }
                    }
                }
            }
        };

        // let a batch task drain pending replies before the socket goes away
        if let Some(active) = session.take() {
            if let Some(batch) = active.batch {
                batch.shutdown().await;
            }
        }
        {
            let mut w = writer.lock().await;
            let _ = wire::send_close(&mut *w).await;
        }
        result
    }

    async fn open_session<W>(
        &self,
        params: SessionParams,
        writer: Arc<Mutex<W>>,
    ) -> Result<Session, Violation>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        params
            .validate(self.store.num_blocks())
            .map_err(|err| Violation(err.to_string()))?;
        let geometry = params
            .is_chunked()
            .then(|| params.geometry(self.store.num_blocks()));
        let stream = params.s.as_ref().map(SeedStream::new);
        let compute_time = Arc::new(Mutex::new(0.0f64));
        let batch = params.b.then(|| {
            BatchHandle::spawn(
                self.store.clone(),
                writer.clone(),
                params.p.then(|| params.cn.clone()),
                compute_time.clone(),
            )
        });
        tracing::debug!(
            k = params.k,
            r = params.r,
            batch = params.b,
            parallel = params.p,
            "session parameters accepted"
        );
        Ok(Session {
            params,
            geometry,
            stream,
            batch,
            compute_time,
        })
    }

    async fn handle_request(
        &self,
        session: &mut Session,
        request: MirrorRequest,
    ) -> Result<Disposition, Violation> {
        match request {
            MirrorRequest::FullBitstring(mask) => {
                if mask.len() != self.store.mask_len() {
                    return Err("Invalid request length".into());
                }
                if session.params.b && session.params.p {
                    return Err("parallel batch session accepts only M requests".into());
                }
                self.answer_serial(session, mask).await
            }
            MirrorRequest::Chunked(chunks) => {
                let geometry = chunked_geometry(session)?;
                let mask = bits::assemble_from_chunks(&chunks, &geometry)
                    .map_err(|err| Violation(err.to_string()))?;
                if session.params.b && session.params.p {
                    return Err("parallel batch session accepts only M requests".into());
                }
                self.answer_serial(session, mask).await
            }
            MirrorRequest::ChunkedRng(chunks) => {
                let geometry = chunked_geometry(session)?;
                let full = expand_secondaries(session, &geometry, chunks)?;
                let mask = bits::assemble_from_chunks(&full, &geometry)
                    .map_err(|err| Violation(err.to_string()))?;
                if session.params.b && session.params.p {
                    return Err("parallel batch session accepts only M requests".into());
                }
                self.answer_serial(session, mask).await
            }
            MirrorRequest::ChunkedRngParallel(chunks) => {
                if !session.params.p {
                    return Err("session not configured for parallel queries".into());
                }
                let geometry = chunked_geometry(session)?;
                let full = expand_secondaries(session, &geometry, chunks)?;
                let masks = bits::assemble_per_chunk_masks(&full, &geometry)
                    .map_err(|err| Violation(err.to_string()))?;
                // one mask per covered chunk, concatenated in chunk-list order
                let mut concatenated = Vec::with_capacity(
                    self.store.mask_len() * session.params.cn.len(),
                );
                for c in &session.params.cn {
                    concatenated
                        .extend_from_slice(masks.get(c).expect("expansion covers every chunk"));
                }
                if let Some(batch) = &session.batch {
                    batch.append(&concatenated).await;
                    return Ok(Disposition::Deferred);
                }
                let started = std::time::Instant::now();
                let answer = self
                    .store
                    .produce_xor_multiple(&concatenated, session.params.cn.len())
                    .map_err(|err| Violation(err.to_string()))?;
                *session.compute_time.lock().await += started.elapsed().as_secs_f64();
                let mut result = ChunkMap::new();
                for (c, block) in session
                    .params
                    .cn
                    .iter()
                    .zip(answer.chunks_exact(self.store.block_size()))
                {
                    result.insert(*c, block.to_vec());
                }
                let reply =
                    codec::encode(&result).map_err(|err| Violation(err.to_string()))?;
                Ok(Disposition::Reply(reply))
            }
            MirrorRequest::ComputeTime => {
                let mut seconds = session.compute_time.lock().await;
                let reply = format!("T{}", *seconds);
                *seconds = 0.0;
                Ok(Disposition::Reply(reply.into_bytes()))
            }
            MirrorRequest::Hello => Ok(Disposition::Reply(wire::MIRROR_HI.to_vec())),
            MirrorRequest::Params(_) | MirrorRequest::Quit => {
                unreachable!("handled by the session loop")
            }
        }
    }

    /// Answer a single-block request: immediately, or via the batch queue.
    async fn answer_serial(
        &self,
        session: &mut Session,
        mask: Vec<u8>,
    ) -> Result<Disposition, Violation> {
        if let Some(batch) = &session.batch {
            batch.append(&mask).await;
            return Ok(Disposition::Deferred);
        }
        let started = std::time::Instant::now();
        let block = self
            .store
            .produce_xor(&mask)
            .map_err(|err| Violation(err.to_string()))?;
        *session.compute_time.lock().await += started.elapsed().as_secs_f64();
        Ok(Disposition::Reply(block))
    }

    async fn send_error<W>(
        &self,
        writer: &Arc<Mutex<W>>,
        message: &str,
    ) -> Result<(), WireError>
    where
        W: AsyncWrite + Unpin,
    {
        tracing::debug!(message, "rejecting request");
        let mut w = writer.lock().await;
        wire::send_message(&mut *w, message.as_bytes()).await
    }
}

fn chunked_geometry(session: &Session) -> Result<ChunkGeometry, Violation> {
    session
        .geometry
        .ok_or_else(|| Violation::from("session not configured for chunked queries"))
}

/// Fill in the secondary chunks from the session keystream, walking the
/// chunk list in the exact order the client gave. Transmitted values for
/// secondary chunks are overwritten; both sides must consume the stream
/// identically or every later mask desynchronizes.
fn expand_secondaries(
    session: &mut Session,
    geometry: &ChunkGeometry,
    mut chunks: ChunkMap,
) -> Result<ChunkMap, Violation> {
    let stream = session
        .stream
        .as_mut()
        .ok_or_else(|| Violation::from("session has no seed for RNG queries"))?;
    for &c in &session.params.cn[1..] {
        chunks.insert(c, stream.next_bits(geometry.bits_of(c as usize)));
    }
    Ok(chunks)
}
