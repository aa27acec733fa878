pub mod client;
pub mod client_types;
pub mod parser;
pub mod tls;

pub use client::*;
pub use client_types::*;
pub use parser::*;
pub use tls::*;

use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as TlsClientStream;

pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Debug + Unpin + Send {}

impl AsyncReadAndWrite for TcpStream {}
impl AsyncReadAndWrite for TlsClientStream<TcpStream> {}
impl AsyncReadAndWrite for TlsClientStream<BoxedAsyncReadAndWrite> {}
impl AsyncReadAndWrite for tokio::io::DuplexStream {}

pub type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;

impl AsyncReadAndWrite for BoxedAsyncReadAndWrite {}
