//! The SecureChannel: state machine, chunk framing, the symmetric and
//! asymmetric crypto pipelines, token rotation and message assembly. The
//! channel consumes raw bytes from a connection, queues encoded chunks for
//! sending and hands completed service messages to the layer above.

use crate::buffer::ChunkBuffer;
use crate::frame::{
    self, AcknowledgeMessage, AsymmetricSecurityHeader, ChunkType, ErrorMessage, HelloMessage,
    MessageType, SecureConversationHeader, SequenceHeader, SymmetricSecurityHeader,
    TcpMessageHeader,
};
use bytes::BytesMut;
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::rc::Rc;
use uabase::logging::{self, Logger};
use uabase::security::{ChannelContext, SecurityPolicy, SECURITY_POLICY_NONE_URI};
use uabase::status::StatusCode;
use uabase::time::{self, DateTime};
use uabase::types::{ByteString, NodeId, UaString};

/// Sequence numbers roll over to 1 past this value. One explicit threshold
/// for both the send and the receive path.
pub const SEQUENCE_NUMBER_WRAP: u32 = 4_294_966_271;
/// A reset is only accepted if the incoming number is below this.
const SEQUENCE_NUMBER_RESET_WINDOW: u32 = 1024;

/// Negotiated buffers below this are rejected (Part 6, 6.7.1).
const MIN_NEGOTIATED_BUFFER_SIZE: u32 = 8192;

const DATA_OFFSET: usize =
    frame::SECURE_CONVERSATION_HEADER_LENGTH + frame::SYMMETRIC_SECURITY_HEADER_LENGTH;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SecureChannelState {
    Fresh,
    HelSent,
    HelReceived,
    AckSent,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum SecurityMode {
    None,
    Sign,
    SignAndEncrypt,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelRole {
    Client,
    Server,
}

/// A time-bounded key set. `token_id` zero means "not set".
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SecurityToken {
    pub channel_id: u32,
    pub token_id: u32,
    pub created_at: DateTime,
    pub revised_lifetime_ms: u32,
}

impl SecurityToken {
    pub fn is_set(&self) -> bool {
        self.token_id != 0
    }

    fn expires_at(&self) -> DateTime {
        self.created_at + time::from_ms(self.revised_lifetime_ms)
    }

    /// End of the inbound grace window: 1.25 times the lifetime.
    fn grace_expires_at(&self) -> DateTime {
        self.created_at + time::from_ms(self.revised_lifetime_ms) * 5 / 4
    }
}

/// Local connection limits; `apply_remote` folds in the peer's HEL/ACK
/// values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub protocol_version: u32,
    pub recv_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            protocol_version: uabase::PROTOCOL_VERSION,
            recv_buffer_size: 65536,
            send_buffer_size: 65536,
            max_message_size: 0,
            max_chunk_count: 0,
        }
    }
}

impl ConnectionConfig {
    /// HEL/ACK negotiation: lowest protocol version, buffers clamped to
    /// what the remote can handle, limits are the minimum of both sides
    /// with zero meaning unlimited. Buffers below 8192 bytes reject the
    /// connection.
    pub fn apply_remote(&mut self, remote: &ConnectionConfig) -> Result<(), StatusCode> {
        if self.protocol_version > remote.protocol_version {
            self.protocol_version = remote.protocol_version;
        }
        if self.recv_buffer_size > remote.send_buffer_size {
            self.recv_buffer_size = remote.send_buffer_size;
        }
        if self.send_buffer_size > remote.recv_buffer_size {
            self.send_buffer_size = remote.recv_buffer_size;
        }
        if remote.max_message_size != 0
            && (self.max_message_size == 0 || self.max_message_size > remote.max_message_size)
        {
            self.max_message_size = remote.max_message_size;
        }
        if remote.max_chunk_count != 0
            && (self.max_chunk_count == 0 || self.max_chunk_count > remote.max_chunk_count)
        {
            self.max_chunk_count = remote.max_chunk_count;
        }

        if self.recv_buffer_size < MIN_NEGOTIATED_BUFFER_SIZE
            || self.send_buffer_size < MIN_NEGOTIATED_BUFFER_SIZE
            || (self.max_message_size != 0 && self.max_message_size < MIN_NEGOTIATED_BUFFER_SIZE)
        {
            return Err(StatusCode::BAD_CONNECTION_REJECTED);
        }
        Ok(())
    }
}

impl From<&HelloMessage> for ConnectionConfig {
    fn from(hello: &HelloMessage) -> ConnectionConfig {
        ConnectionConfig {
            protocol_version: hello.protocol_version,
            recv_buffer_size: hello.receive_buffer_size,
            send_buffer_size: hello.send_buffer_size,
            max_message_size: hello.max_message_size,
            max_chunk_count: hello.max_chunk_count,
        }
    }
}

impl From<&AcknowledgeMessage> for ConnectionConfig {
    fn from(ack: &AcknowledgeMessage) -> ConnectionConfig {
        ConnectionConfig {
            protocol_version: ack.protocol_version,
            recv_buffer_size: ack.receive_buffer_size,
            send_buffer_size: ack.send_buffer_size,
            max_message_size: ack.max_message_size,
            max_chunk_count: ack.max_chunk_count,
        }
    }
}

/// A completed inbound message, assembled from one or more chunks.
#[derive(Debug)]
pub struct InboundMessage {
    pub message_type: MessageType,
    pub request_id: u32,
    pub body: BytesMut,
}

pub struct SecureChannel {
    role: ChannelRole,
    state: SecureChannelState,
    mode: SecurityMode,
    config: ConnectionConfig,
    endpoint_url: UaString,

    /// Policies available for establishing the channel.
    policies: Vec<Rc<dyn SecurityPolicy>>,
    /// The active policy after the first OPN exchange.
    policy: Option<Rc<dyn SecurityPolicy>>,
    context: Option<Box<dyn ChannelContext>>,
    /// Keys of the superseded token, kept for the inbound grace window.
    previous_context: Option<Box<dyn ChannelContext>>,

    security_token: SecurityToken,
    next_token: SecurityToken,
    previous_token: SecurityToken,

    local_nonce: ByteString,
    remote_nonce: ByteString,
    remote_certificate: ByteString,
    remote_certificate_thumbprint: ByteString,

    send_sequence_number: u32,
    receive_sequence_number: u32,

    /// Per-requestId accumulation of intermediate chunk bodies.
    chunks: HashMap<u32, BytesMut>,
    /// Raw TCP reassembly.
    chunk_buffer: ChunkBuffer,

    /// Encoded chunks waiting to be handed to the connection.
    out: Vec<Vec<u8>>,
    error_sent: bool,

    log: Logger,
}

impl SecureChannel {
    pub fn new(
        role: ChannelRole,
        policies: Vec<Rc<dyn SecurityPolicy>>,
        mode: SecurityMode,
        config: ConnectionConfig,
        log: Logger,
    ) -> SecureChannel {
        let chunk_buffer = ChunkBuffer::new(config.recv_buffer_size as usize);
        SecureChannel {
            role,
            state: SecureChannelState::Fresh,
            mode,
            config,
            endpoint_url: UaString::null(),
            policies,
            policy: None,
            context: None,
            previous_context: None,
            security_token: SecurityToken::default(),
            next_token: SecurityToken::default(),
            previous_token: SecurityToken::default(),
            local_nonce: ByteString::null(),
            remote_nonce: ByteString::null(),
            remote_certificate: ByteString::null(),
            remote_certificate_thumbprint: ByteString::null(),
            send_sequence_number: 0,
            receive_sequence_number: 0,
            chunks: HashMap::new(),
            chunk_buffer,
            out: Vec::new(),
            error_sent: false,
            log,
        }
    }

    pub fn state(&self) -> SecureChannelState {
        self.state
    }

    pub fn security_mode(&self) -> SecurityMode {
        self.mode
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn endpoint_url(&self) -> &UaString {
        &self.endpoint_url
    }

    pub fn current_token(&self) -> &SecurityToken {
        &self.security_token
    }

    pub fn previous_token(&self) -> &SecurityToken {
        &self.previous_token
    }

    pub fn local_nonce(&self) -> &ByteString {
        &self.local_nonce
    }

    /// Encoded chunks ready for the wire, in send order.
    pub fn take_output(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.out)
    }

    /// Selects the active policy and parses the remote certificate. The
    /// client does this before its first OPN; the server resolves the
    /// policy from the OPN header instead.
    pub fn activate_policy(
        &mut self,
        policy_uri: &str,
        remote_certificate: &ByteString,
    ) -> Result<(), StatusCode> {
        let policy = self
            .policies
            .iter()
            .find(|policy| policy.policy_uri() == policy_uri)
            .cloned()
            .ok_or(StatusCode::BAD_SECURITY_POLICY_REJECTED)?;

        self.remote_certificate_thumbprint = policy.certificate_thumbprint(remote_certificate);
        self.context = Some(policy.make_channel_context(remote_certificate)?);
        self.remote_certificate = remote_certificate.clone();
        self.policy = Some(policy);
        Ok(())
    }

    /// Generates a fresh local nonce with the active policy.
    pub fn generate_local_nonce(&mut self) -> Result<&ByteString, StatusCode> {
        let policy = self.active_policy()?;
        let mut nonce = vec![0u8; policy.secure_channel_nonce_length()];
        policy.generate_nonce(&mut nonce)?;
        self.local_nonce = ByteString::new(nonce);
        Ok(&self.local_nonce)
    }

    /// Client side: queue the HEL chunk.
    pub fn send_hello(&mut self, endpoint_url: &str) -> Result<(), StatusCode> {
        if self.role != ChannelRole::Client || self.state != SecureChannelState::Fresh {
            return Err(StatusCode::BAD_INVALID_STATE);
        }

        let hello = HelloMessage {
            protocol_version: self.config.protocol_version,
            receive_buffer_size: self.config.recv_buffer_size,
            send_buffer_size: self.config.send_buffer_size,
            max_message_size: self.config.max_message_size,
            max_chunk_count: self.config.max_chunk_count,
            endpoint_url: UaString::new(endpoint_url),
        };

        let mut body = Vec::new();
        hello.encode(&mut body)?;

        let mut chunk = Vec::with_capacity(frame::MESSAGE_HEADER_LENGTH + body.len());
        TcpMessageHeader {
            message_type: MessageType::Hel,
            chunk_type: ChunkType::Final,
            message_size: (frame::MESSAGE_HEADER_LENGTH + body.len()) as u32,
        }
        .encode(&mut chunk)?;
        chunk.extend_from_slice(&body);

        self.endpoint_url = hello.endpoint_url.clone();
        self.out.push(chunk);
        self.state = SecureChannelState::HelSent;
        logging::debug!(self.log, "HEL sent"; "endpoint" => endpoint_url);
        Ok(())
    }

    /// Queue an OPN chunk through the asymmetric pipeline. The body is the
    /// already encoded OpenSecureChannel service payload.
    pub fn send_open(&mut self, request_id: u32, body: &[u8]) -> Result<(), StatusCode> {
        match self.state {
            SecureChannelState::HelReceived
            | SecureChannelState::AckSent
            | SecureChannelState::Open => {}
            _ => return Err(StatusCode::BAD_INVALID_STATE),
        }

        let policy = self.active_policy()?;
        let secured = self.mode != SecurityMode::None;

        // OPN chunks are encrypted even in Sign-only mode
        let asym_header = AsymmetricSecurityHeader {
            security_policy_uri: ByteString::from(policy.policy_uri().as_bytes()),
            sender_certificate: if secured {
                policy.local_certificate().clone()
            } else {
                ByteString::null()
            },
            receiver_certificate_thumbprint: if secured {
                self.remote_certificate_thumbprint.clone()
            } else {
                ByteString::null()
            },
        };
        let security_header_length = asym_header.encoded_len();
        let payload_offset = frame::SECURE_CONVERSATION_HEADER_LENGTH + security_header_length;

        let mut chunk = Vec::with_capacity(payload_offset + body.len() + 64);
        SecureConversationHeader {
            header: TcpMessageHeader {
                message_type: MessageType::Opn,
                chunk_type: ChunkType::Final,
                message_size: 0,
            },
            secure_channel_id: self.security_token.channel_id,
        }
        .encode(&mut chunk)?;
        asym_header.encode(&mut chunk)?;
        SequenceHeader {
            sequence_number: self.next_sequence_number(),
            request_id,
        }
        .encode(&mut chunk)?;
        chunk.extend_from_slice(body);

        let mut signature_size = 0;
        if secured {
            let context = self.context.as_ref().ok_or(StatusCode::BAD_INTERNAL_ERROR)?;
            let asym = policy.asymmetric();
            signature_size = asym.local_signature_size(context.as_ref());

            // pad to the remote plaintext block size
            let block_size = asym.remote_plain_text_block_size(context.as_ref()).max(1);
            let extra_padding = asym.remote_encryption_key_bits(context.as_ref()) > 2048;
            let padding_field = if extra_padding { 2 } else { 1 };
            let bytes_to_write = chunk.len() - payload_offset;
            let total_padding = block_size
                - ((bytes_to_write + signature_size + padding_field) % block_size);
            let padding_byte = (total_padding & 0xFF) as u8;
            for _ in 0..=total_padding {
                chunk.push(padding_byte);
            }
            if extra_padding {
                chunk.push((total_padding >> 8) as u8);
            }
        }

        // the encoded message size includes the encryption overhead
        let encryption_overhead = if secured {
            let context = self.context.as_ref().ok_or(StatusCode::BAD_INTERNAL_ERROR)?;
            let data_length = chunk.len() + signature_size - payload_offset;
            policy
                .asymmetric()
                .encryption_overhead(context.as_ref(), data_length)
        } else {
            0
        };
        let total_length = chunk.len() + signature_size + encryption_overhead;
        chunk[4..8].copy_from_slice(&(total_length as u32).to_le_bytes());

        if secured {
            let context = self.context.as_ref().ok_or(StatusCode::BAD_INTERNAL_ERROR)?;
            let asym = policy.asymmetric();

            let mut signature = vec![0u8; signature_size];
            asym.sign(context.as_ref(), &chunk, &mut signature)?;
            chunk.extend_from_slice(&signature);

            asym.encrypt(context.as_ref(), &mut chunk, payload_offset)?;
        }

        self.out.push(chunk);
        logging::debug!(self.log, "OPN queued"; "request_id" => request_id);
        Ok(())
    }

    /// Queue a MSG or CLO message through the symmetric pipeline, chunked
    /// to the negotiated send buffer size. A violated message-size or
    /// chunk-count budget replaces the remainder with one ABORT chunk.
    pub fn send_message(
        &mut self,
        request_id: u32,
        message_type: MessageType,
        type_id: &NodeId,
        body: &[u8],
    ) -> Result<(), StatusCode> {
        if message_type != MessageType::Msg && message_type != MessageType::Clo {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        if self.state != SecureChannelState::Open {
            return Err(StatusCode::BAD_INVALID_STATE);
        }

        // a staged renewal token becomes active with the next send
        if self.next_token.is_set() {
            self.revolve_tokens()?;
        }

        let mut payload = Vec::with_capacity(body.len() + 8);
        type_id.encode(&mut payload)?;
        payload.extend_from_slice(body);

        let capacity = self.chunk_payload_capacity()?;
        let mut offset = 0;
        let mut chunk_count: u32 = 0;
        let mut message_size: usize = 0;

        loop {
            let part = (payload.len() - offset).min(capacity);
            let is_final = offset + part == payload.len();
            let chunk_type = if is_final {
                ChunkType::Final
            } else {
                ChunkType::Intermediate
            };

            let chunk =
                self.encode_symmetric_chunk(message_type, chunk_type, request_id, &payload[offset..offset + part])?;
            chunk_count += 1;
            message_size += chunk.len();

            let over_message_size = self.config.max_message_size != 0
                && message_size > self.config.max_message_size as usize;
            let over_chunk_count =
                self.config.max_chunk_count != 0 && chunk_count > self.config.max_chunk_count;
            if over_message_size || over_chunk_count {
                logging::warn!(self.log, "message exceeds the negotiated limits, aborting";
                               "request_id" => request_id,
                               "message_size" => message_size,
                               "chunk_count" => chunk_count);
                let abort = self.encode_abort_chunk(
                    message_type,
                    request_id,
                    StatusCode::BAD_RESPONSE_TOO_LARGE,
                )?;
                self.out.push(abort);
                return Err(StatusCode::BAD_RESPONSE_TOO_LARGE);
            }

            self.out.push(chunk);
            offset += part;
            if is_final {
                break;
            }
        }
        Ok(())
    }

    /// Installs the token pair negotiated in an OPN exchange. The first
    /// call opens the channel; later calls stage the renewal token that
    /// becomes active once the peer starts using it.
    pub fn complete_open(
        &mut self,
        token: SecurityToken,
        remote_nonce: ByteString,
        now: DateTime,
    ) -> Result<(), StatusCode> {
        if !token.is_set() {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }
        if self.state == SecureChannelState::Closing || self.state == SecureChannelState::Closed {
            return Err(StatusCode::BAD_INVALID_STATE);
        }

        self.remote_nonce = remote_nonce;

        if !self.security_token.is_set() {
            self.security_token = token;
            self.generate_new_keys()?;
            self.state = SecureChannelState::Open;
            self.log = self.log.new(logging::o!("channel_id" => token.channel_id));
            logging::info!(self.log, "secure channel opened";
                           "token_id" => token.token_id,
                           "lifetime_ms" => token.revised_lifetime_ms,
                           "created_at" => now);
        } else {
            self.next_token = token;
            logging::info!(self.log, "secure channel renewed";
                           "next_token_id" => token.token_id);
        }
        Ok(())
    }

    /// Marks the channel closed after the underlying connection is gone and
    /// drops any half-assembled messages.
    pub fn handle_disconnect(&mut self) {
        self.state = SecureChannelState::Closed;
        self.chunks.clear();
        self.chunk_buffer.clear();
        logging::debug!(self.log, "channel closed");
    }

    /// Consumes raw bytes from the connection and returns the completed
    /// inbound messages. On a fatal error the channel queues at most one
    /// sanitized ERR chunk (none for security failures), enters Closing and
    /// returns the status code.
    pub fn process(
        &mut self,
        data: &[u8],
        now: DateTime,
    ) -> Result<Vec<InboundMessage>, StatusCode> {
        if self.state == SecureChannelState::Closed {
            return Err(StatusCode::BAD_CONNECTION_CLOSED);
        }

        let chunks = match self.chunk_buffer.feed(data) {
            Ok(chunks) => chunks,
            Err(code) => return Err(self.fail(code)),
        };

        let mut messages = Vec::new();
        for mut chunk in chunks {
            if let Err(code) = self.process_chunk(&mut chunk, now, &mut messages) {
                return Err(self.fail(code));
            }
        }
        Ok(messages)
    }

    fn process_chunk(
        &mut self,
        chunk: &mut BytesMut,
        now: DateTime,
        messages: &mut Vec<InboundMessage>,
    ) -> Result<(), StatusCode> {
        let mut stream = &chunk[..];
        let header = TcpMessageHeader::decode(&mut stream)?;

        match header.message_type {
            MessageType::Hel => self.process_hello(&chunk[frame::MESSAGE_HEADER_LENGTH..]),
            MessageType::Ack => self.process_ack(&chunk[frame::MESSAGE_HEADER_LENGTH..]),
            MessageType::Err => {
                let mut stream = &chunk[frame::MESSAGE_HEADER_LENGTH..];
                let error = ErrorMessage::decode(&mut stream)?;
                logging::warn!(self.log, "received ERR, closing";
                               "status" => %error.error, "reason" => error.reason.as_str());
                self.state = SecureChannelState::Closing;
                messages.push(InboundMessage {
                    message_type: MessageType::Err,
                    request_id: 0,
                    body: BytesMut::from(&chunk[frame::MESSAGE_HEADER_LENGTH..]),
                });
                Ok(())
            }
            MessageType::Opn => self.process_opn_chunk(chunk, messages),
            MessageType::Msg | MessageType::Clo => {
                self.process_symmetric_chunk(chunk, header, now, messages)
            }
        }
    }

    /// Server side: negotiate the connection parameters and queue the ACK.
    fn process_hello(&mut self, body: &[u8]) -> Result<(), StatusCode> {
        if self.role != ChannelRole::Server || self.state != SecureChannelState::Fresh {
            return Err(StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID);
        }

        let mut stream = body;
        let hello = HelloMessage::decode(&mut stream)?;
        self.config.apply_remote(&ConnectionConfig::from(&hello))?;
        self.chunk_buffer.set_limit(self.config.recv_buffer_size as usize);
        self.endpoint_url = hello.endpoint_url.clone();
        self.state = SecureChannelState::HelReceived;

        logging::debug!(self.log, "HEL received";
                        "endpoint" => hello.endpoint_url.as_str(),
                        "send_buffer_size" => self.config.send_buffer_size,
                        "recv_buffer_size" => self.config.recv_buffer_size);

        let ack = AcknowledgeMessage {
            protocol_version: self.config.protocol_version,
            receive_buffer_size: self.config.recv_buffer_size,
            send_buffer_size: self.config.send_buffer_size,
            max_message_size: self.config.max_message_size,
            max_chunk_count: self.config.max_chunk_count,
        };
        let mut chunk = Vec::with_capacity(frame::MESSAGE_HEADER_LENGTH + 20);
        TcpMessageHeader {
            message_type: MessageType::Ack,
            chunk_type: ChunkType::Final,
            message_size: (frame::MESSAGE_HEADER_LENGTH + 20) as u32,
        }
        .encode(&mut chunk)?;
        ack.encode(&mut chunk)?;
        self.out.push(chunk);
        self.state = SecureChannelState::AckSent;
        Ok(())
    }

    /// Client side: apply the server's revision of the parameters.
    fn process_ack(&mut self, body: &[u8]) -> Result<(), StatusCode> {
        if self.role != ChannelRole::Client || self.state != SecureChannelState::HelSent {
            return Err(StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID);
        }

        let mut stream = body;
        let ack = AcknowledgeMessage::decode(&mut stream)?;
        self.config.apply_remote(&ConnectionConfig::from(&ack))?;
        self.chunk_buffer.set_limit(self.config.recv_buffer_size as usize);
        self.state = SecureChannelState::HelReceived;

        logging::debug!(self.log, "ACK received";
                        "send_buffer_size" => self.config.send_buffer_size,
                        "recv_buffer_size" => self.config.recv_buffer_size,
                        "max_message_size" => self.config.max_message_size);
        Ok(())
    }

    /// The asymmetric receive pipeline for OPN chunks.
    fn process_opn_chunk(
        &mut self,
        chunk: &mut BytesMut,
        messages: &mut Vec<InboundMessage>,
    ) -> Result<(), StatusCode> {
        match self.state {
            SecureChannelState::HelReceived
            | SecureChannelState::AckSent
            | SecureChannelState::Open => {}
            _ => return Err(StatusCode::BAD_INVALID_STATE),
        }

        let chunk_len = chunk.len();
        let mut stream = &chunk[..];
        let sc_header = SecureConversationHeader::decode(&mut stream)?;
        if sc_header.header.chunk_type != ChunkType::Final {
            return Err(StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID);
        }
        self.check_channel_id(sc_header.secure_channel_id)?;

        let asym_header = AsymmetricSecurityHeader::decode(&mut stream)?;
        let header_end = chunk_len - stream.len();

        // resolve or verify the policy by uri
        match &self.policy {
            Some(policy) => {
                if policy.policy_uri().as_bytes() != asym_header.security_policy_uri.as_slice() {
                    return Err(StatusCode::BAD_SECURITY_POLICY_REJECTED);
                }
            }
            None => {
                let policy = self
                    .policies
                    .iter()
                    .find(|policy| {
                        policy.policy_uri().as_bytes()
                            == asym_header.security_policy_uri.as_slice()
                    })
                    .cloned();
                match policy {
                    Some(policy) => {
                        logging::debug!(self.log, "using security policy";
                                        "uri" => policy.policy_uri());
                        self.policy = Some(policy);
                    }
                    None => return Err(StatusCode::BAD_SECURITY_POLICY_REJECTED),
                }
            }
        }
        let policy = self.active_policy()?;
        let secured = policy.policy_uri() != SECURITY_POLICY_NONE_URI;

        // trust and revocation checks are delegated to the policy
        if secured {
            policy.verify_certificate(&asym_header.sender_certificate)?;
        }

        if self.context.is_none() {
            self.context = Some(policy.make_channel_context(&asym_header.sender_certificate)?);
            self.remote_certificate = asym_header.sender_certificate.clone();
            self.remote_certificate_thumbprint =
                policy.certificate_thumbprint(&asym_header.sender_certificate);
        }

        let mut plaintext_end = chunk_len;
        let mut signature_size = 0;
        let mut padding_size = 0;

        if secured {
            let context = self.context.as_ref().ok_or(StatusCode::BAD_INTERNAL_ERROR)?;
            let asym = policy.asymmetric();

            // decrypt with the local private key
            let plaintext_length = asym.decrypt(context.as_ref(), &mut chunk[header_end..])?;
            plaintext_end = header_end + plaintext_length;

            // verify with the sender's public key
            signature_size = asym.remote_signature_size(context.as_ref());
            if plaintext_end < header_end + frame::SEQUENCE_HEADER_LENGTH + signature_size {
                return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
            }
            let (signed, signature) = chunk[..plaintext_end].split_at(plaintext_end - signature_size);
            asym.verify(context.as_ref(), signed, signature)
                .map_err(|_| StatusCode::BAD_SECURITY_CHECKS_FAILED)?;

            // the padding is sized by the receiver's key
            let tail = plaintext_end - signature_size;
            padding_size = chunk[tail - 1] as usize;
            if asym.local_encryption_key_bits(context.as_ref()) > 2048 {
                padding_size <<= 8;
                padding_size += 1;
                padding_size += chunk[tail - 2] as usize;
            }
            padding_size += 1;
        }

        let mut stream = &chunk[header_end..];
        let sequence_header = SequenceHeader::decode(&mut stream)?;
        // the OPN chunk sets the baseline for symmetric sequence checking
        self.receive_sequence_number = sequence_header.sequence_number;

        let body_start = header_end + frame::SEQUENCE_HEADER_LENGTH;
        let body_end = plaintext_end
            .checked_sub(signature_size + padding_size)
            .ok_or(StatusCode::BAD_SECURITY_CHECKS_FAILED)?;
        if body_end < body_start {
            return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
        }

        logging::debug!(self.log, "OPN received";
                        "request_id" => sequence_header.request_id,
                        "body_size" => body_end - body_start);

        messages.push(InboundMessage {
            message_type: MessageType::Opn,
            request_id: sequence_header.request_id,
            body: BytesMut::from(&chunk[body_start..body_end]),
        });
        Ok(())
    }

    /// The symmetric receive pipeline for MSG/CLO chunks.
    fn process_symmetric_chunk(
        &mut self,
        chunk: &mut BytesMut,
        header: TcpMessageHeader,
        now: DateTime,
        messages: &mut Vec<InboundMessage>,
    ) -> Result<(), StatusCode> {
        if self.state != SecureChannelState::Open {
            return Err(StatusCode::BAD_INVALID_STATE);
        }

        let chunk_len = chunk.len();
        let mut stream = &chunk[..];
        let sc_header = SecureConversationHeader::decode(&mut stream)?;
        self.check_channel_id(sc_header.secure_channel_id)?;

        let sym_header = SymmetricSecurityHeader::decode(&mut stream)?;
        let use_previous = self.check_symmetric_token(sym_header.token_id, now)?;

        let policy = self.active_policy()?;
        let sym = policy.symmetric();
        let context = if use_previous {
            self.previous_context.as_ref()
        } else {
            self.context.as_ref()
        }
        .ok_or(StatusCode::BAD_INTERNAL_ERROR)?;

        if self.mode == SecurityMode::SignAndEncrypt {
            sym.decrypt(context.as_ref(), &mut chunk[DATA_OFFSET..])
                .map_err(|_| StatusCode::BAD_SECURITY_CHECKS_FAILED)?;
        }

        let mut tail = chunk_len;
        if self.mode != SecurityMode::None {
            let signature_size = sym.signature_size();
            if chunk_len < DATA_OFFSET + frame::SEQUENCE_HEADER_LENGTH + signature_size {
                return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
            }
            let (signed, signature) = chunk[..].split_at(chunk_len - signature_size);
            sym.verify(context.as_ref(), signed, signature)
                .map_err(|_| StatusCode::BAD_SECURITY_CHECKS_FAILED)?;
            tail -= signature_size;
        }

        if self.mode == SecurityMode::SignAndEncrypt {
            let mut padding_size = chunk[tail - 1] as usize;
            if sym.encryption_key_bits() > 2048 {
                padding_size <<= 8;
                padding_size += 1;
                padding_size += chunk[tail - 2] as usize;
            }
            padding_size += 1;
            if padding_size > tail - DATA_OFFSET - frame::SEQUENCE_HEADER_LENGTH {
                return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
            }
            tail -= padding_size;
        }

        let mut stream = &chunk[DATA_OFFSET..];
        let sequence_header = SequenceHeader::decode(&mut stream)?;
        self.process_sequence_number(sequence_header.sequence_number)?;

        let body_start = DATA_OFFSET + frame::SEQUENCE_HEADER_LENGTH;
        if tail < body_start {
            return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
        }
        let body = &chunk[body_start..tail];
        let request_id = sequence_header.request_id;

        match header.chunk_type {
            ChunkType::Intermediate => {
                let entry = self.chunks.entry(request_id).or_default();
                entry.extend_from_slice(body);
                if self.config.max_message_size != 0
                    && entry.len() > self.config.max_message_size as usize
                {
                    self.chunks.remove(&request_id);
                    return Err(StatusCode::BAD_TCP_MESSAGE_TOO_LARGE);
                }
            }
            ChunkType::Final => {
                let mut message = self.chunks.remove(&request_id).unwrap_or_default();
                message.extend_from_slice(body);
                messages.push(InboundMessage {
                    message_type: header.message_type,
                    request_id,
                    body: message,
                });
                if header.message_type == MessageType::Clo {
                    logging::debug!(self.log, "CLO received, closing");
                    self.state = SecureChannelState::Closing;
                }
            }
            ChunkType::Abort => {
                // the whole request is dropped without notice
                self.chunks.remove(&request_id);
                logging::debug!(self.log, "request aborted by the peer";
                                "request_id" => request_id);
            }
        }
        Ok(())
    }

    fn check_channel_id(&self, channel_id: u32) -> Result<(), StatusCode> {
        // before the first OPN completes no id is assigned; the server
        // accepts id 0 from a connecting client, the client accepts the
        // server-assigned id in the OPN response
        if self.security_token.is_set() && channel_id != self.security_token.channel_id {
            return Err(StatusCode::BAD_SECURE_CHANNEL_ID_INVALID);
        }
        Ok(())
    }

    /// Token checks for an inbound symmetric chunk. Returns true if the
    /// chunk is protected by the previous token's keys.
    fn check_symmetric_token(&mut self, token_id: u32, now: DateTime) -> Result<bool, StatusCode> {
        if self.security_token.is_set() && token_id == self.security_token.token_id {
            if self.security_token.expires_at() < now {
                self.state = SecureChannelState::Closing;
                return Err(StatusCode::BAD_SECURE_CHANNEL_CLOSED);
            }
            return Ok(false);
        }

        if self.next_token.is_set() && token_id == self.next_token.token_id {
            self.revolve_tokens()?;
            return Ok(false);
        }

        if self.previous_token.is_set() && token_id == self.previous_token.token_id {
            // inbound only, within 1.25x the original lifetime
            if self.previous_token.grace_expires_at() < now {
                return Err(StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN);
            }
            return Ok(true);
        }

        Err(StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN)
    }

    /// previous <- current <- next; the keys of the superseded token stay
    /// available for the grace window, new key material is derived from the
    /// nonces exchanged in the renewal.
    fn revolve_tokens(&mut self) -> Result<(), StatusCode> {
        if !self.next_token.is_set() {
            return Err(StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN);
        }

        let policy = self.active_policy()?;
        let fresh_context = policy.make_channel_context(&self.remote_certificate)?;
        self.previous_context = std::mem::replace(&mut self.context, Some(fresh_context));

        self.previous_token = self.security_token;
        self.security_token = self.next_token;
        self.next_token = SecurityToken::default();
        self.generate_new_keys()?;

        logging::info!(self.log, "tokens revolved";
                       "token_id" => self.security_token.token_id,
                       "previous_token_id" => self.previous_token.token_id);
        Ok(())
    }

    /// Derives and installs the symmetric key material on the channel
    /// context: local keys from (remote nonce, local nonce), remote keys
    /// from the reversed order.
    fn generate_new_keys(&mut self) -> Result<(), StatusCode> {
        let policy = self.active_policy()?;
        if self.context.is_none() {
            self.context = Some(policy.make_channel_context(&self.remote_certificate)?);
        }
        let context = self.context.as_mut().ok_or(StatusCode::BAD_INTERNAL_ERROR)?;

        let sym = policy.symmetric();
        let signing_len = sym.signing_key_length();
        let encrypting_len = sym.encryption_key_length();
        let iv_len = sym.encryption_block_size();
        let mut buffer = vec![0u8; signing_len + encrypting_len + iv_len];

        policy.generate_key(
            self.remote_nonce.as_slice(),
            self.local_nonce.as_slice(),
            &mut buffer,
        )?;
        context.set_local_sym_signing_key(&buffer[..signing_len]);
        context.set_local_sym_encrypting_key(&buffer[signing_len..signing_len + encrypting_len]);
        context.set_local_sym_iv(&buffer[signing_len + encrypting_len..]);

        policy.generate_key(
            self.local_nonce.as_slice(),
            self.remote_nonce.as_slice(),
            &mut buffer,
        )?;
        context.set_remote_sym_signing_key(&buffer[..signing_len]);
        context.set_remote_sym_encrypting_key(&buffer[signing_len..signing_len + encrypting_len]);
        context.set_remote_sym_iv(&buffer[signing_len + encrypting_len..]);
        Ok(())
    }

    fn active_policy(&self) -> Result<Rc<dyn SecurityPolicy>, StatusCode> {
        self.policy.clone().ok_or(StatusCode::BAD_INVALID_STATE)
    }

    /// Plaintext body capacity of one symmetric chunk: the send buffer
    /// minus headers, signature and the worst-case padding reserve.
    fn chunk_payload_capacity(&self) -> Result<usize, StatusCode> {
        let mut capacity =
            self.config.send_buffer_size as usize - frame::SYMMETRIC_CHUNK_PREFIX_LENGTH;

        if self.mode != SecurityMode::None {
            let policy = self.active_policy()?;
            let sym = policy.symmetric();
            capacity = capacity
                .checked_sub(sym.signature_size())
                .ok_or(StatusCode::BAD_INTERNAL_ERROR)?;

            if self.mode == SecurityMode::SignAndEncrypt {
                let block_size = sym.encryption_block_size().max(1);
                // padding-size field plus the room to round up to a whole
                // number of encryption blocks
                let padding_field = 1 + usize::from(block_size >> 8 != 0);
                let max_encrypt_size =
                    self.config.send_buffer_size as usize - DATA_OFFSET;
                capacity = capacity
                    .checked_sub(padding_field + (max_encrypt_size % block_size) + 1)
                    .ok_or(StatusCode::BAD_INTERNAL_ERROR)?;
            }
        }
        Ok(capacity)
    }

    fn encode_symmetric_chunk(
        &mut self,
        message_type: MessageType,
        chunk_type: ChunkType,
        request_id: u32,
        body: &[u8],
    ) -> Result<Vec<u8>, StatusCode> {
        let mut chunk = Vec::with_capacity(DATA_OFFSET + frame::SEQUENCE_HEADER_LENGTH + body.len() + 64);

        SecureConversationHeader {
            header: TcpMessageHeader {
                message_type,
                chunk_type,
                message_size: 0,
            },
            secure_channel_id: self.security_token.channel_id,
        }
        .encode(&mut chunk)?;
        SymmetricSecurityHeader {
            token_id: self.security_token.token_id,
        }
        .encode(&mut chunk)?;
        SequenceHeader {
            sequence_number: self.next_sequence_number(),
            request_id,
        }
        .encode(&mut chunk)?;
        chunk.extend_from_slice(body);

        if self.mode == SecurityMode::None {
            let total = chunk.len();
            chunk[4..8].copy_from_slice(&(total as u32).to_le_bytes());
            return Ok(chunk);
        }

        let policy = self.active_policy()?;
        let sym = policy.symmetric();
        let context = self.context.as_ref().ok_or(StatusCode::BAD_INTERNAL_ERROR)?;
        let signature_size = sym.signature_size();

        if self.mode == SecurityMode::SignAndEncrypt {
            let block_size = sym.encryption_block_size().max(1);
            let bytes_to_write = body.len() + frame::SEQUENCE_HEADER_LENGTH;
            let total_padding =
                block_size - ((bytes_to_write + signature_size + 1) % block_size);
            let padding_byte = (total_padding & 0xFF) as u8;
            for _ in 0..=total_padding {
                chunk.push(padding_byte);
            }
            let extra_padding = (total_padding >> 8) as u8;
            if extra_padding > 0 {
                chunk.push(extra_padding);
            }
        }

        // the size field is part of the signed data, patch it first
        let total = chunk.len() + signature_size;
        chunk[4..8].copy_from_slice(&(total as u32).to_le_bytes());

        let mut signature = vec![0u8; signature_size];
        sym.sign(context.as_ref(), &chunk, &mut signature)?;
        chunk.extend_from_slice(&signature);

        if self.mode == SecurityMode::SignAndEncrypt {
            sym.encrypt(context.as_ref(), &mut chunk[DATA_OFFSET..])?;
        }
        Ok(chunk)
    }

    /// One ABORT chunk carrying `{code, reason}` terminates an oversized
    /// request without tearing the channel down.
    fn encode_abort_chunk(
        &mut self,
        message_type: MessageType,
        request_id: u32,
        code: StatusCode,
    ) -> Result<Vec<u8>, StatusCode> {
        let error = ErrorMessage {
            error: code,
            reason: UaString::new(code.name()),
        };
        let mut body = Vec::with_capacity(error.encoded_len());
        error.encode(&mut body)?;
        self.encode_symmetric_chunk(message_type, ChunkType::Abort, request_id, &body)
    }

    fn next_sequence_number(&mut self) -> u32 {
        // explicit reset point, the receive side accepts the jump
        if self.send_sequence_number >= SEQUENCE_NUMBER_WRAP {
            self.send_sequence_number = 1;
        } else {
            self.send_sequence_number += 1;
        }
        self.send_sequence_number
    }

    fn process_sequence_number(&mut self, sequence_number: u32) -> Result<(), StatusCode> {
        if sequence_number != self.receive_sequence_number.wrapping_add(1) {
            if self.receive_sequence_number >= SEQUENCE_NUMBER_WRAP
                && sequence_number < SEQUENCE_NUMBER_RESET_WINDOW
            {
                self.receive_sequence_number = sequence_number.wrapping_sub(1);
            } else {
                return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
            }
        }
        self.receive_sequence_number = self.receive_sequence_number.wrapping_add(1);
        Ok(())
    }

    /// Queues a final ERR chunk with the sanitized status code. At most one
    /// ERR leaves the channel.
    fn queue_error(&mut self, code: StatusCode) -> Result<(), StatusCode> {
        let sanitized = code.sanitized();
        let error = ErrorMessage {
            error: sanitized,
            reason: if sanitized == code {
                UaString::new(code.name())
            } else {
                UaString::null()
            },
        };

        let mut chunk = Vec::with_capacity(frame::MESSAGE_HEADER_LENGTH + error.encoded_len());
        TcpMessageHeader {
            message_type: MessageType::Err,
            chunk_type: ChunkType::Final,
            message_size: (frame::MESSAGE_HEADER_LENGTH + error.encoded_len()) as u32,
        }
        .encode(&mut chunk)?;
        error.encode(&mut chunk)?;
        self.out.push(chunk);
        Ok(())
    }

    /// Fatal-error path: queue at most one sanitized ERR (security failures
    /// close silently to avoid an oracle) and enter Closing.
    fn fail(&mut self, code: StatusCode) -> StatusCode {
        logging::warn!(self.log, "closing the channel on error"; "status" => %code);

        let silent = code == StatusCode::BAD_SECURITY_CHECKS_FAILED;
        if !silent && !self.error_sent {
            if self.queue_error(code).is_ok() {
                self.error_sent = true;
            }
        }
        self.state = SecureChannelState::Closing;
        code
    }
}
