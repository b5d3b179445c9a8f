//! Streaming rewrite of the receive-pack ref-update section.
//!
//! [`Tagger`] wraps the client-to-server byte stream handed to
//! `git-receive-pack`. While the first flush packet has not been seen it
//! consumes ref-update pkt-lines and replaces each one with a tag creation
//! under `refs/tags/submissions/<submission-id>/`, so nothing a client
//! pushes can land outside the submission namespace. Everything after the
//! flush (the packfile) passes through untouched and unbuffered.

use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, ReadBuf};

use crate::pktline;

const NULL_OID: &str = "0000000000000000000000000000000000000000";
const SUBMISSION_TAG_PREFIX: &str = "refs/tags/submissions/";

/// Tags created for one push, keyed by the object id the client proposed
/// for each ref.
pub type NewTags = BTreeMap<String, Vec<String>>;

/// The rewriting reader. Construct one per push over the (bounded) channel
/// input and hand it to the receive-pack subprocess as stdin.
pub struct Tagger<R> {
    inner: R,
    submission_id: Option<String>,
    new_tags: NewTags,
    err: Option<String>,
    state: State,
}

enum State {
    /// Accumulating the next header item, either a four-byte length prefix
    /// or the payload it announced.
    Header {
        out: Vec<u8>,
        scratch: Vec<u8>,
        need: usize,
        in_payload: bool,
    },
    /// Emitting the rewritten header before switching to pass-through.
    Drain { out: Vec<u8>, pos: usize },
    PassThrough,
}

enum Step {
    Continue,
    Finished(Vec<u8>),
    Failed(String),
}

impl<R> Tagger<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            submission_id: None,
            new_tags: NewTags::new(),
            err: None,
            state: State::Header {
                out: Vec::new(),
                scratch: Vec::new(),
                need: 4,
                in_payload: false,
            },
        }
    }

    /// The id namespacing this push's tags. Assigned on the first read.
    pub fn submission_id(&self) -> Option<&str> {
        self.submission_id.as_deref()
    }

    /// Tags synthesized so far, keyed by the client's proposed object id.
    pub fn new_tags(&self) -> &NewTags {
        &self.new_tags
    }

    /// The protocol error that poisoned the stream, if any. Once set, every
    /// further read fails with it.
    pub fn error(&self) -> Option<&str> {
        self.err.as_deref()
    }
}

/// Rewrite one ref-update payload into a submission-tag creation line,
/// recording the new tag. Errors are protocol violations that poison the
/// stream.
fn rewrite_line(line: &[u8], submission_id: &str, tags: &mut NewTags) -> Result<Vec<u8>, String> {
    // Only the text before the first NUL is the update triple; capability
    // flags after it are dropped. Lines past the first carry no NUL at all.
    let parseable = match line.iter().position(|&b| b == 0) {
        Some(nul) => &line[..nul],
        None => line,
    };
    let text = String::from_utf8_lossy(parseable);
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() != 3 {
        return Err(format!(
            "protocol error: unexpected amount of fields in pkt-line: {:?}",
            String::from_utf8_lossy(line)
        ));
    }
    let (new_oid, ref_name) = (fields[1], fields[2]);

    if ref_name.starts_with(SUBMISSION_TAG_PREFIX) {
        return Err("pushing submission tags disallowed".to_string());
    }

    let new_line =
        format!("{NULL_OID} {new_oid} {SUBMISSION_TAG_PREFIX}{submission_id}/{ref_name}\n");
    let prefix = pktline::encode_len(new_line.len()).map_err(|_| "tag name too long".to_string())?;

    let mut rewritten = Vec::with_capacity(new_line.len() + 4);
    rewritten.extend_from_slice(&prefix);
    rewritten.extend_from_slice(new_line.as_bytes());

    tags.entry(new_oid.to_string())
        .or_default()
        .push(format!("submissions/{submission_id}/{ref_name}"));
    Ok(rewritten)
}

fn submission_id_now() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    nanos.to_string()
}

impl<R: AsyncRead + Unpin> AsyncRead for Tagger<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(err) = &this.err {
                return Poll::Ready(Err(io::Error::other(err.clone())));
            }
            match &mut this.state {
                State::PassThrough => return Pin::new(&mut this.inner).poll_read(cx, buf),
                State::Drain { out, pos } => {
                    let n = (out.len() - *pos).min(buf.remaining());
                    buf.put_slice(&out[*pos..*pos + n]);
                    *pos += n;
                    if *pos == out.len() {
                        this.state = State::PassThrough;
                    }
                    return Poll::Ready(Ok(()));
                }
                State::Header {
                    out,
                    scratch,
                    need,
                    in_payload,
                } => {
                    if this.submission_id.is_none() {
                        this.submission_id = Some(submission_id_now());
                    }
                    let submission_id = this.submission_id.as_deref().unwrap_or_default();

                    if scratch.len() < *need {
                        let mut tmp = [0u8; 512];
                        let want = (*need - scratch.len()).min(tmp.len());
                        let mut tmp_buf = ReadBuf::new(&mut tmp[..want]);
                        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut tmp_buf))?;
                        if tmp_buf.filled().is_empty() {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "unexpected end of ref-update section",
                            )));
                        }
                        scratch.extend_from_slice(tmp_buf.filled());
                        if scratch.len() < *need {
                            continue;
                        }
                    }

                    let step = if !*in_payload {
                        let mut prefix = [0u8; 4];
                        prefix.copy_from_slice(scratch);
                        match pktline::parse_len(&prefix) {
                            Ok(0) => {
                                out.extend_from_slice(pktline::FLUSH);
                                Step::Finished(std::mem::take(out))
                            }
                            Ok(len) if len < 4 => Step::Failed(format!(
                                "protocol error: invalid pkt-line length {len}"
                            )),
                            Ok(len) => {
                                scratch.clear();
                                *need = len - 4;
                                *in_payload = true;
                                Step::Continue
                            }
                            Err(e) => Step::Failed(format!("protocol error: {e}")),
                        }
                    } else {
                        // The original line never reaches the output; only the
                        // synthesized tag creation is forwarded.
                        let line = std::mem::take(scratch);
                        match rewrite_line(&line, submission_id, &mut this.new_tags) {
                            Ok(rewritten) => {
                                out.extend_from_slice(&rewritten);
                                *need = 4;
                                *in_payload = false;
                                Step::Continue
                            }
                            Err(msg) => Step::Failed(msg),
                        }
                    };

                    match step {
                        Step::Continue => {}
                        Step::Finished(out) => {
                            this.state = State::Drain { out, pos: 0 };
                        }
                        Step::Failed(msg) => {
                            this.err = Some(msg);
                        }
                    }
                }
            }
        }
    }
}
