//! # Cache Connections
//!
//! One TCP session per pooled connection, with reusable buffers. New
//! sessions authenticate and select their logical database before they are
//! handed to the pool.

use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use tracing::{debug, warn};

use dax_common::{CacheConfig, DaxError, DaxResult};
use dax_pool::ManageConnection;

use crate::resp::{encode_command, read_response, RespValue};

/// Single TCP connection with reusable buffers.
pub struct CacheConnection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
    broken: bool,
}

impl CacheConnection {
    fn open(config: &CacheConfig) -> DaxResult<Self> {
        let stream = connect_stream(config)?;
        stream.set_read_timeout(config.read_timeout())?;
        stream.set_write_timeout(config.write_timeout())?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        let mut conn = CacheConnection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
            broken: false,
        };

        if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
            conn.handshake(&[&b"AUTH"[..], password.as_bytes()], "authentication failed")?;
        }
        if config.db != 0 {
            let db = config.db.to_string();
            conn.handshake(&[&b"SELECT"[..], db.as_bytes()], "failed to select database")?;
        }
        Ok(conn)
    }

    /// Sends one command and reads its reply. IO and framing failures leave
    /// the connection marked broken.
    pub fn exec<A: AsRef<[u8]>>(&mut self, args: &[A]) -> DaxResult<RespValue> {
        let result = self.roundtrip(args);
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn roundtrip<A: AsRef<[u8]>>(&mut self, args: &[A]) -> DaxResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;

        read_response(&mut self.reader, &mut self.line_buf)
    }

    fn handshake(&mut self, args: &[&[u8]], what: &str) -> DaxResult<()> {
        match self.exec(args)? {
            RespValue::Error(message) => Err(DaxError::connection(format!(
                "{what}: {}",
                String::from_utf8_lossy(&message)
            ))),
            _ => Ok(()),
        }
    }
}

fn connect_stream(config: &CacheConfig) -> DaxResult<TcpStream> {
    let addr = config.addr();
    let resolved: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|err| DaxError::connection_with(format!("cannot resolve {addr}"), err))?
        .collect();

    let mut last_err = None;
    for candidate in resolved {
        let attempt = match config.connect_timeout() {
            Some(timeout) => TcpStream::connect_timeout(&candidate, timeout),
            None => TcpStream::connect(candidate),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }

    Err(match last_err {
        Some(err) => DaxError::connection_with(format!("failed to connect to cache at {addr}"), err),
        None => DaxError::connection(format!("no address found for {addr}")),
    })
}

/// Pool hooks for cache connections.
pub struct CacheManager {
    config: CacheConfig,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        CacheManager { config }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

impl ManageConnection for CacheManager {
    type Connection = CacheConnection;

    fn connect(&self) -> DaxResult<CacheConnection> {
        let conn = CacheConnection::open(&self.config)?;
        debug!(addr = %self.config.addr(), db = self.config.db, "opened cache connection");
        Ok(conn)
    }

    fn has_broken(&self, conn: &mut CacheConnection) -> bool {
        conn.is_broken()
    }

    fn recycle(&self, conn: &mut CacheConnection) -> bool {
        if conn.is_broken() {
            warn!("dropping broken cache connection");
            return false;
        }
        true
    }
}
