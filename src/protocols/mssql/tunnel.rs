//! TLS-in-TDS adapter
//!
//! During PRELOGIN the TLS handshake records travel inside TDS packets. The
//! adapter sits between the TLS engine and the socket: writes are collected
//! until the engine flushes (or waits for a reply) and then sent as one
//! PRELOGIN message, reads have their TDS headers stripped. Once the
//! handshake is done [`TdsTlsAdapter::finish_handshake`] turns it into a
//! plain pass-through.

use super::tds::{encode_message, TdsHeader, TdsPacketType, TDS_HEADER_SIZE};
use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const ACCEPTED_TYPES: [TdsPacketType; 2] = [TdsPacketType::Prelogin, TdsPacketType::TabularResult];

pub struct TdsTlsAdapter<S> {
    inner: S,
    tunneling: bool,
    packet_size: usize,
    packet_id: u8,
    /// TLS bytes of the current flight, not yet framed
    flight: BytesMut,
    /// Framed bytes waiting for the socket
    outbound: BytesMut,
    header: [u8; TDS_HEADER_SIZE],
    header_len: usize,
    payload_remaining: usize,
    saw_valid_header: bool,
}

impl<S> TdsTlsAdapter<S> {
    pub fn new(inner: S, packet_size: usize, packet_id: u8) -> Self {
        Self {
            inner,
            tunneling: true,
            packet_size,
            packet_id,
            flight: BytesMut::new(),
            outbound: BytesMut::new(),
            header: [0; TDS_HEADER_SIZE],
            header_len: 0,
            payload_remaining: 0,
            saw_valid_header: false,
        }
    }

    /// Stop framing; later traffic is raw TLS records
    pub fn finish_handshake(&mut self) {
        self.frame_flight();
        self.tunneling = false;
    }

    pub fn is_tunneling(&self) -> bool {
        self.tunneling
    }

    /// A TDS header passed validation on this adapter
    pub fn saw_valid_header(&self) -> bool {
        self.saw_valid_header
    }

    pub fn packet_id(&self) -> u8 {
        self.packet_id
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Frame the buffered flight as one PRELOGIN message
    fn frame_flight(&mut self) {
        if self.flight.is_empty() {
            return;
        }
        let wire = encode_message(TdsPacketType::Prelogin, &self.flight, self.packet_size, &mut self.packet_id);
        self.outbound.extend_from_slice(&wire);
        self.flight.clear();
    }
}

impl<S: AsyncWrite + Unpin> TdsTlsAdapter<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.frame_flight();
        while !self.outbound.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.outbound))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.outbound.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for TdsTlsAdapter<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // The peer will not answer until our last flight is on the wire
        ready!(this.poll_drain(cx))?;

        if !this.tunneling {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if this.payload_remaining > 0 {
                let limit = this.payload_remaining.min(buf.remaining());
                let mut window = ReadBuf::new(buf.initialize_unfilled_to(limit));
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut window))?;
                let n = window.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed inside a TDS packet",
                    )));
                }
                buf.advance(n);
                this.payload_remaining -= n;
                return Poll::Ready(Ok(()));
            }

            while this.header_len < TDS_HEADER_SIZE {
                let mut window = ReadBuf::new(&mut this.header[this.header_len..]);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut window))?;
                let n = window.filled().len();
                if n == 0 {
                    if this.header_len == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed inside a TDS header",
                    )));
                }
                this.header_len += n;
            }

            this.header_len = 0;
            let header = TdsHeader::decode(&this.header);
            if let Err(e) = header.validate(&ACCEPTED_TYPES) {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())));
            }
            this.saw_valid_header = true;
            this.payload_remaining = header.payload_len();
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TdsTlsAdapter<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.tunneling {
            this.flight.extend_from_slice(buf);
            return Poll::Ready(Ok(buf.len()));
        }

        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
