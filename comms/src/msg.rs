use std::{borrow::Cow, io};

use bytemuck::{AnyBitPattern, NoUninit};

use crate::{
    Deserialize, Serialize,
    protocol::{self, HEADER_SIZE, Header},
};

/// The training status a node announces to every shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Training,
    Finished,
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// First message of every link, identifies the connecting end.
    ///
    /// `client` is `None` for the node level status link.
    Hello {
        node: usize,
        client: Option<usize>,
        devices: usize,
    },
    Status {
        node: usize,
        status: NodeStatus,
    },
}

/// Metadata piggybacked on every gradient push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushMeta {
    pub client: u32,
    pub batch_words: u64,
}

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<'a> {
    /// A dense gradient slice for one shard.
    Grad {
        meta: PushMeta,
        grad: Cow<'a, [f32]>,
    },
    /// The top-k entries of a gradient slice for one shard.
    SparseGrad {
        meta: PushMeta,
        indices: Cow<'a, [u32]>,
        values: Cow<'a, [f32]>,
    },
    /// The updated dense parameters of a shard.
    Params(Cow<'a, [f32]>),
    /// The top-k entries of the parameter delta of a shard.
    SparseDelta {
        indices: Cow<'a, [u32]>,
        values: Cow<'a, [f32]>,
    },
    /// A request for the current dense parameters of a shard.
    Pull { client: u32 },
}

/// The application layer message for the entire system.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg<'a> {
    Err(Cow<'a, str>),
    Control(Command),
    Data(Payload<'a>),
}

impl<'a> Payload<'a> {
    /// Detaches the payload from the buffer it was deserialized from.
    pub fn into_owned(self) -> Payload<'static> {
        match self {
            Payload::Grad { meta, grad } => Payload::Grad {
                meta,
                grad: Cow::Owned(grad.into_owned()),
            },
            Payload::SparseGrad {
                meta,
                indices,
                values,
            } => Payload::SparseGrad {
                meta,
                indices: Cow::Owned(indices.into_owned()),
                values: Cow::Owned(values.into_owned()),
            },
            Payload::Params(params) => Payload::Params(Cow::Owned(params.into_owned())),
            Payload::SparseDelta { indices, values } => Payload::SparseDelta {
                indices: Cow::Owned(indices.into_owned()),
                values: Cow::Owned(values.into_owned()),
            },
            Payload::Pull { client } => Payload::Pull { client },
        }
    }
}

impl<'a> Msg<'a> {
    /// Detaches the message from the buffer it was deserialized from.
    pub fn into_owned(self) -> Msg<'static> {
        match self {
            Msg::Err(detail) => Msg::Err(Cow::Owned(detail.into_owned())),
            Msg::Control(cmd) => Msg::Control(cmd),
            Msg::Data(payload) => Msg::Data(payload.into_owned()),
        }
    }

    /// The wire tag name of this message, used in diagnostics.
    pub fn tag_name(&self) -> &'static str {
        match self {
            Msg::Err(_) => "err",
            Msg::Control(Command::Hello { .. }) => "control/hello",
            Msg::Control(Command::Status { .. }) => "control/status",
            Msg::Data(Payload::Grad { .. }) => "grad_push",
            Msg::Data(Payload::SparseGrad { .. }) => "grad_push_sparse",
            Msg::Data(Payload::Params(_)) => "param_push",
            Msg::Data(Payload::SparseDelta { .. }) => "param_push_sparse",
            Msg::Data(Payload::Pull { .. }) => "param_pull",
        }
    }
}

fn invalid_data<T>(text: String) -> io::Result<T> {
    Err(io::Error::new(io::ErrorKind::InvalidData, text))
}

/// Reinterprets `bytes` as a slice of `T`, copying only when `bytes` is misaligned.
fn cast<T: AnyBitPattern + NoUninit>(bytes: &[u8]) -> Cow<'_, [T]> {
    match bytemuck::try_cast_slice(bytes) {
        Ok(nums) => Cow::Borrowed(nums),
        Err(_) => Cow::Owned(
            bytes
                .chunks_exact(size_of::<T>())
                .map(bytemuck::pod_read_unaligned)
                .collect(),
        ),
    }
}

fn put_sparse(buf: &mut Vec<u8>, indices: &[u32], values: &[f32]) -> io::Result<()> {
    if indices.len() != values.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "sparse payload has {} indices but {} values",
                indices.len(),
                values.len()
            ),
        ));
    }

    let count = u32::try_from(indices.len())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    buf.extend_from_slice(&count.to_be_bytes());
    buf.extend_from_slice(bytemuck::cast_slice(indices));
    Ok(())
}

fn put_meta(buf: &mut Vec<u8>, meta: &PushMeta) {
    buf.extend_from_slice(&meta.client.to_be_bytes());
    buf.extend_from_slice(&meta.batch_words.to_be_bytes());
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        let put_header = |buf: &mut Vec<u8>, header: Header| {
            buf.extend_from_slice(&header.to_be_bytes());
        };

        match self {
            Msg::Err(detail) => {
                put_header(buf, protocol::ERR);
                Ok(Some(detail.as_bytes()))
            }
            Msg::Control(cmd) => {
                put_header(buf, protocol::CONTROL);
                serde_json::to_writer(&mut *buf, cmd)?;
                Ok(None)
            }
            Msg::Data(Payload::Grad { meta, grad }) => {
                put_header(buf, protocol::GRAD_PUSH);
                put_meta(buf, meta);
                Ok(Some(bytemuck::cast_slice(grad)))
            }
            Msg::Data(Payload::SparseGrad {
                meta,
                indices,
                values,
            }) => {
                put_header(buf, protocol::GRAD_PUSH_SPARSE);
                put_meta(buf, meta);
                put_sparse(buf, indices, values)?;
                Ok(Some(bytemuck::cast_slice(values)))
            }
            Msg::Data(Payload::Params(params)) => {
                put_header(buf, protocol::PARAM_PUSH);
                Ok(Some(bytemuck::cast_slice(params)))
            }
            Msg::Data(Payload::SparseDelta { indices, values }) => {
                put_header(buf, protocol::PARAM_PUSH_SPARSE);
                put_sparse(buf, indices, values)?;
                Ok(Some(bytemuck::cast_slice(values)))
            }
            Msg::Data(Payload::Pull { client }) => {
                put_header(buf, protocol::PARAM_PULL);
                buf.extend_from_slice(&client.to_be_bytes());
                Ok(None)
            }
        }
    }
}

/// A forward only view over a frame body.
struct Body<'a> {
    buf: &'a [u8],
}

impl<'a> Body<'a> {
    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.buf.len() < n {
            return invalid_data(format!(
                "truncated frame body, needed {n} more bytes but only {} remain",
                self.buf.len()
            ));
        }

        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u32(&mut self) -> io::Result<u32> {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(bytes))
    }

    fn u64(&mut self) -> io::Result<u64> {
        let mut bytes = [0; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(bytes))
    }

    fn meta(&mut self) -> io::Result<PushMeta> {
        let client = self.u32()?;
        let batch_words = self.u64()?;
        Ok(PushMeta {
            client,
            batch_words,
        })
    }

    fn array<T: AnyBitPattern + NoUninit>(&mut self, count: usize) -> io::Result<Cow<'a, [T]>> {
        let bytes = self.take(count * size_of::<T>())?;
        Ok(cast(bytes))
    }

    fn rest<T: AnyBitPattern + NoUninit>(&mut self) -> io::Result<Cow<'a, [T]>> {
        let size = size_of::<T>();
        if self.buf.len() % size != 0 {
            return invalid_data(format!(
                "frame body of {} bytes is not a whole number of {size} byte items",
                self.buf.len()
            ));
        }

        let count = self.buf.len() / size;
        self.array(count)
    }

    fn sparse(&mut self) -> io::Result<(Cow<'a, [u32]>, Cow<'a, [f32]>)> {
        let count = self.u32()? as usize;
        let indices = self.array(count)?;
        let values = self.array(count)?;
        Ok((indices, values))
    }

    fn finish<T>(self, value: T) -> io::Result<T> {
        match self.buf.len() {
            0 => Ok(value),
            n => invalid_data(format!("{n} trailing bytes after the frame body")),
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return invalid_data(format!(
                "The given buffer is too small {}, must at least be {HEADER_SIZE} bytes",
                buf.len()
            ));
        }

        let (header, rest) = buf.split_at(HEADER_SIZE);
        let mut tag = [0; HEADER_SIZE];
        tag.copy_from_slice(header);

        let mut body = Body { buf: rest };

        match Header::from_be_bytes(tag) {
            protocol::ERR => {
                let detail = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Msg::Err(Cow::Borrowed(detail)))
            }
            protocol::CONTROL => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Msg::Control(cmd))
            }
            protocol::GRAD_PUSH => {
                let meta = body.meta()?;
                let grad = body.rest()?;
                body.finish(Msg::Data(Payload::Grad { meta, grad }))
            }
            protocol::GRAD_PUSH_SPARSE => {
                let meta = body.meta()?;
                let (indices, values) = body.sparse()?;
                body.finish(Msg::Data(Payload::SparseGrad {
                    meta,
                    indices,
                    values,
                }))
            }
            protocol::PARAM_PUSH => {
                let params = body.rest()?;
                body.finish(Msg::Data(Payload::Params(params)))
            }
            protocol::PARAM_PUSH_SPARSE => {
                let (indices, values) = body.sparse()?;
                body.finish(Msg::Data(Payload::SparseDelta { indices, values }))
            }
            protocol::PARAM_PULL => {
                let client = body.u32()?;
                body.finish(Msg::Data(Payload::Pull { client }))
            }
            tag => invalid_data(format!("Received an invalid tag {tag}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(msg: &Msg<'_>) -> Vec<u8> {
        let mut buf = Vec::new();
        let tail = msg.serialize(&mut buf).unwrap().map(<[u8]>::to_vec);
        buf.extend(tail.unwrap_or_default());
        buf
    }

    #[test]
    fn sparse_grad_keeps_pairs_and_meta() {
        let msg = Msg::Data(Payload::SparseGrad {
            meta: PushMeta {
                client: 3,
                batch_words: 1024,
            },
            indices: Cow::Owned(vec![1, 4, 9]),
            values: Cow::Owned(vec![0.5, -2.0, 7.25]),
        });

        let buf = encode(&msg);
        let decoded = Msg::deserialize(&buf).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn control_status_is_json() {
        let msg = Msg::Control(Command::Status {
            node: 1,
            status: NodeStatus::Finished,
        });

        let buf = encode(&msg);
        assert!(std::str::from_utf8(&buf[HEADER_SIZE..]).unwrap().contains("finished"));
        assert_eq!(Msg::deserialize(&buf).unwrap(), msg);
    }

    #[test]
    fn misaligned_body_is_copied() {
        let msg = Msg::Data(Payload::Params(Cow::Owned(vec![1.0, 2.0, 3.0])));
        let buf = encode(&msg);

        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&buf);

        let decoded = Msg::deserialize(&shifted[1..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn mismatched_sparse_lengths_are_rejected() {
        let msg = Msg::Data(Payload::SparseDelta {
            indices: Cow::Owned(vec![0, 1]),
            values: Cow::Owned(vec![1.0]),
        });

        let err = msg.serialize(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn truncated_and_unknown_frames_are_rejected() {
        let msg = Msg::Data(Payload::Pull { client: 7 });
        let buf = encode(&msg);

        let err = Msg::deserialize(&buf[..buf.len() - 1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err = Msg::deserialize(&99u32.to_be_bytes()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn odd_sized_dense_body_is_rejected() {
        let mut buf = protocol::PARAM_PUSH.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0, 0, 0]);

        assert!(Msg::deserialize(&buf).is_err());
    }
}
