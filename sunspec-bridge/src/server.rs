use std::future::{self, Future};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::{io, net::SocketAddr};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_modbus::server::tcp::Server;
use tokio_modbus::{ExceptionCode, Quantity, Request, Response};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::layout::PDU_ADDRESS_OFFSET;
use crate::registers::RegisterReader;

/// Largest register count of a single read holding registers request.
pub const MAX_READ_QUANTITY: Quantity = 125;

/// The Modbus port could not be opened. Nothing else can work without it.
#[derive(Debug, thiserror::Error)]
#[error("cannot listen for Modbus TCP on {addr}: {source}")]
pub struct ServerBindError {
    pub addr: SocketAddr,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Clone)]
/// Read-only [tokio_modbus::server::Service] answering from the register table.
pub struct RegisterService(RegisterReader);

impl RegisterService {
    pub fn new(reader: RegisterReader) -> Self {
        Self(reader)
    }

    fn handle(&self, req: Request<'_>) -> Result<Response, ExceptionCode> {
        match req {
            Request::ReadHoldingRegisters(addr, cnt) => {
                if cnt == 0 || cnt > MAX_READ_QUANTITY {
                    debug!(addr, cnt, "SERVER: Exception::IllegalDataValue");
                    return Err(ExceptionCode::IllegalDataValue);
                }
                let reg_addr = addr
                    .checked_add(PDU_ADDRESS_OFFSET)
                    .ok_or(ExceptionCode::IllegalDataAddress)?;
                self.0
                    .read(reg_addr, cnt)
                    .map(Response::ReadHoldingRegisters)
                    .map_err(|err| {
                        debug!(addr, cnt, %err, "SERVER: Exception::IllegalDataAddress");
                        ExceptionCode::IllegalDataAddress
                    })
            }
            _ => {
                warn!("SERVER: Exception::IllegalFunction - Unimplemented function code in request: {req:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        }
    }
}

impl tokio_modbus::server::Service for RegisterService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        future::ready(self.handle(req))
    }
}

/// Client connection handed to the tokio-modbus server.
///
/// Reads report end of stream once `shutdown` is cancelled, which ends the
/// request loop of the connection and drops the socket. The tracker token
/// is released with it.
struct Connection {
    stream: TcpStream,
    shutdown: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    _tracked: TaskTrackerToken,
}

impl Connection {
    fn new(stream: TcpStream, shutdown: CancellationToken, tracked: TaskTrackerToken) -> Self {
        Self {
            stream,
            cancelled: Box::pin(shutdown.clone().cancelled_owned()),
            shutdown,
            _tracked: tracked,
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.shutdown.is_cancelled() || self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Bound Modbus TCP listener.
#[derive(Debug)]
pub struct ModbusServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ModbusServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self, ServerBindError> {
        let bind_error = |source| ServerBindError { addr, source };
        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve read requests until `shutdown` is cancelled.
    ///
    /// On return the listener and every client connection are closed.
    pub async fn serve(self, reader: RegisterReader, shutdown: CancellationToken) -> io::Result<()> {
        let local_addr = self.local_addr;
        let server = Server::new(self.listener);
        let service = RegisterService::new(reader);
        let connections = shutdown.child_token();
        let tracker = TaskTracker::new();
        let on_connected = |stream: TcpStream, socket_addr: SocketAddr| {
            let connection = Connection::new(stream, connections.clone(), tracker.token());
            let service = service.clone();
            async move {
                debug!(%socket_addr, "modbus client connected");
                Ok::<_, io::Error>(Some((service, connection)))
            }
        };
        let on_process_error = |err: io::Error| {
            warn!(%err, "modbus connection error");
        };

        info!(%local_addr, "modbus server listening");
        let result = tokio::select! {
            result = server.serve(&on_connected, on_process_error) => result,
            _ = shutdown.cancelled() => Ok(()),
        };

        connections.cancel();
        tracker.close();
        tracker.wait().await;
        info!(%local_addr, "modbus server stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{RegisterImage, RegisterTable};
    use tokio_modbus::server::Service;

    fn service() -> RegisterService {
        let mut image = RegisterImage::new();
        image.insert(40070, &[213, 124]);
        RegisterService::new(RegisterTable::new(image).reader())
    }

    #[tokio::test]
    async fn test_read_model_header() {
        let response = service()
            .call(Request::ReadHoldingRegisters(40069, 2))
            .await
            .unwrap();
        assert_eq!(response, Response::ReadHoldingRegisters(vec![213, 124]));
    }

    #[tokio::test]
    async fn test_read_exceptions() {
        let service = service();
        assert_eq!(
            service.call(Request::ReadHoldingRegisters(0, 1)).await,
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            service.call(Request::ReadHoldingRegisters(40195, 4)).await,
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            service.call(Request::ReadHoldingRegisters(40000, 0)).await,
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            service.call(Request::ReadHoldingRegisters(40000, 126)).await,
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            service.call(Request::ReadHoldingRegisters(u16::MAX, 1)).await,
            Err(ExceptionCode::IllegalDataAddress)
        );
    }

    #[tokio::test]
    async fn test_writes_are_refused() {
        let service = service();
        assert_eq!(
            service.call(Request::WriteSingleRegister(40069, 1)).await,
            Err(ExceptionCode::IllegalFunction)
        );
        assert_eq!(
            service.call(Request::ReadInputRegisters(40069, 1)).await,
            Err(ExceptionCode::IllegalFunction)
        );
        let response = service
            .call(Request::ReadHoldingRegisters(40069, 1))
            .await
            .unwrap();
        assert_eq!(response, Response::ReadHoldingRegisters(vec![213]));
    }

    #[tokio::test]
    async fn test_bind_error_on_used_port() {
        let first = ModbusServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = first.local_addr();
        let err = ModbusServer::bind(addr).await.unwrap_err();
        assert_eq!(err.addr, addr);
        assert_eq!(err.source.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_connections() {
        use tokio_modbus::client::{tcp, Reader};

        let mut image = RegisterImage::new();
        image.insert(40070, &[213, 124]);
        let table = RegisterTable::new(image);
        let server = ModbusServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr();
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(server.serve(table.reader(), shutdown.clone()));

        let mut ctx = tcp::connect(addr).await.unwrap();
        assert_eq!(
            ctx.read_holding_registers(40069, 1).await.unwrap(),
            Ok(vec![213])
        );

        shutdown.cancel();
        serving.await.unwrap().unwrap();

        assert!(ctx.read_holding_registers(40069, 1).await.is_err());
        assert!(tcp::connect(addr).await.is_err());
    }
}
