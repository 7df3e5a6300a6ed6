#![cfg(target_os = "linux")]

use std::cell::Cell;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::thread;

use mooring::{
    Accepted, Direction, ErrorCode, FatalError, Ipv4Address, Operation, QueueError, Server, Socket,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A server with one listening socket on an ephemeral port.
fn listening_server() -> (Server, Socket, u16) {
    let mut server = Server::create().unwrap();
    server.bind_sockets(4);
    let listener = server.create_socket(0).unwrap();
    let port = listener.local_addr().unwrap().port();
    assert_ne!(port, 0);
    (server, listener, port)
}

fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).unwrap()
}

#[test]
fn echoes_bytes_end_to_end() {
    init_logging();
    let (mut server, listener, port) = listening_server();

    server
        .create_acceptor(
            listener,
            |server: &mut Server,
             error: ErrorCode,
             conn: &mut Accepted,
             address: Ipv4Address| {
                assert_eq!(error, ErrorCode::Ok);
                assert_eq!(address.octets(), [127, 0, 0, 1]);
                assert_ne!(address.port(), 0);
                let socket = conn.claim().expect("first claim yields the connection");
                let dock = server.create_dock(socket).unwrap();
                server
                    .queue_read(
                        dock,
                        vec![0u8; 64],
                        move |server: &mut Server,
                              error: ErrorCode,
                              operation: Operation,
                              bytes: u32| {
                            assert_eq!(error, ErrorCode::Ok);
                            assert_eq!(operation.direction(), Direction::Read);
                            assert_eq!(operation.dock(), dock);
                            let mut reply = operation.into_buffer();
                            reply.truncate(bytes as usize);
                            assert_eq!(reply, b"ping");
                            server
                                .queue_write(
                                    dock,
                                    reply,
                                    |_server: &mut Server,
                                     error: ErrorCode,
                                     operation: Operation,
                                     bytes: u32| {
                                        assert_eq!(error, ErrorCode::Ok);
                                        assert_eq!(operation.direction(), Direction::Write);
                                        assert_eq!(bytes, 4);
                                        false
                                    },
                                )
                                .unwrap();
                            true
                        },
                    )
                    .unwrap();
                true
            },
        )
        .unwrap();

    let client = thread::spawn(move || {
        let mut stream = connect(port);
        stream.write_all(b"ping").unwrap();
        let mut echoed = [0u8; 4];
        stream.read_exact(&mut echoed).unwrap();
        echoed
    });

    server.run().unwrap();
    assert_eq!(&client.join().unwrap(), b"ping");
    server.destroy().unwrap();
}

#[test]
fn unclaimed_connections_are_closed() {
    init_logging();
    let (mut server, listener, port) = listening_server();

    server
        .create_acceptor(
            listener,
            |_server: &mut Server,
             error: ErrorCode,
             _conn: &mut Accepted,
             _address: Ipv4Address| {
                assert_eq!(error, ErrorCode::Ok);
                // Leave the connection to the runtime and stop the loop.
                false
            },
        )
        .unwrap();

    let client = thread::spawn(move || {
        let mut stream = connect(port);
        let mut buffer = [0u8; 1];
        // The runtime closes the unclaimed connection, so the peer observes
        // an orderly shutdown or a reset, never data.
        match stream.read(&mut buffer) {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("received {n} unexpected bytes"),
        }
    });

    server.run().unwrap();
    client.join().unwrap();
}

#[test]
fn acceptor_rearms_between_connections() {
    init_logging();
    let (mut server, listener, port) = listening_server();
    let accepted = Rc::new(Cell::new(0u32));
    let seen = accepted.clone();

    server
        .create_acceptor(
            listener,
            move |_server: &mut Server,
                  error: ErrorCode,
                  _conn: &mut Accepted,
                  _address: Ipv4Address| {
                assert_eq!(error, ErrorCode::Ok);
                seen.set(seen.get() + 1);
                seen.get() < 2
            },
        )
        .unwrap();

    let client = thread::spawn(move || {
        let first = connect(port);
        let second = connect(port);
        drop(first);
        drop(second);
    });

    server.run().unwrap();
    client.join().unwrap();
    assert_eq!(accepted.get(), 2);
}

#[test]
fn slots_are_exclusive_per_direction_and_independent_across() {
    init_logging();
    let (mut server, listener, port) = listening_server();
    let completions = Rc::new(Cell::new(0u32));
    let observed = completions.clone();

    server
        .create_acceptor(
            listener,
            move |server: &mut Server,
                  error: ErrorCode,
                  conn: &mut Accepted,
                  _address: Ipv4Address| {
                assert_eq!(error, ErrorCode::Ok);
                let socket = conn.claim().unwrap();
                let dock = server.create_dock(socket).unwrap();

                let on_read = {
                    let completions = observed.clone();
                    move |server: &mut Server,
                          error: ErrorCode,
                          operation: Operation,
                          bytes: u32| {
                        assert_eq!(error, ErrorCode::Ok);
                        let mut received = operation.into_buffer();
                        received.truncate(bytes as usize);
                        assert_eq!(received, b"ping");
                        // The slot is free again from inside the callback.
                        assert!(!server.operation_active(dock, Direction::Read));
                        completions.set(completions.get() + 1);
                        completions.get() < 2
                    }
                };
                server.queue_read(dock, vec![0u8; 32], on_read).unwrap();

                // The read slot is taken; a second read is rejected without
                // disturbing the one in flight.
                match server.queue_read(dock, vec![0u8; 8], |_, _, _, _| true) {
                    Err(QueueError::SlotBusy {
                        direction: Direction::Read,
                        buffer,
                    }) => assert_eq!(buffer.len(), 8),
                    other => panic!("expected a busy rejection, got {other:?}"),
                }
                assert!(server.operation_active(dock, Direction::Read));
                assert!(!server.operation_active(dock, Direction::Write));

                // The write slot is independent of the read slot.
                let on_write = {
                    let completions = observed.clone();
                    move |_server: &mut Server,
                          error: ErrorCode,
                          _operation: Operation,
                          bytes: u32| {
                        assert_eq!(error, ErrorCode::Ok);
                        assert_eq!(bytes, 5);
                        completions.set(completions.get() + 1);
                        completions.get() < 2
                    }
                };
                server
                    .queue_write(dock, b"hello".to_vec(), on_write)
                    .unwrap();
                assert!(server.operation_active(dock, Direction::Write));
                true
            },
        )
        .unwrap();

    let client = thread::spawn(move || {
        let mut stream = connect(port);
        stream.write_all(b"ping").unwrap();
        let mut greeting = [0u8; 5];
        stream.read_exact(&mut greeting).unwrap();
        assert_eq!(&greeting, b"hello");
    });

    server.run().unwrap();
    client.join().unwrap();
    assert_eq!(completions.get(), 2);
}

#[cfg(target_pointer_width = "64")]
#[test]
fn oversized_buffers_are_rejected_before_the_os() {
    init_logging();
    let (mut server, listener, port) = listening_server();

    server
        .create_acceptor(
            listener,
            |server: &mut Server,
             error: ErrorCode,
             conn: &mut Accepted,
             _address: Ipv4Address| {
                assert_eq!(error, ErrorCode::Ok);
                let socket = conn.claim().unwrap();
                let dock = server.create_dock(socket).unwrap();

                // One byte past the limit; the zeroed pages are never
                // touched, so the allocation stays uncommitted.
                let huge = vec![0u8; i32::MAX as usize + 1];
                match server.queue_read(dock, huge, |_, _, _, _| true) {
                    Err(QueueError::BufferTooLarge { len, buffer }) => {
                        assert_eq!(len, i32::MAX as usize + 1);
                        assert_eq!(buffer.len(), len);
                    }
                    other => panic!("expected a size rejection, got {other:?}"),
                }
                assert!(!server.operation_active(dock, Direction::Read));
                false
            },
        )
        .unwrap();

    let client = thread::spawn(move || {
        let _stream = connect(port);
    });

    server.run().unwrap();
    client.join().unwrap();
}

#[test]
fn destroyed_docks_go_stale() {
    init_logging();
    let (mut server, listener, port) = listening_server();

    server
        .create_acceptor(
            listener,
            |server: &mut Server,
             error: ErrorCode,
             conn: &mut Accepted,
             _address: Ipv4Address| {
                assert_eq!(error, ErrorCode::Ok);
                let socket = conn.claim().unwrap();
                let dock = server.create_dock(socket).unwrap();
                server.destroy_dock(dock).unwrap();

                match server.queue_read(dock, vec![0u8; 4], |_, _, _, _| true) {
                    Err(QueueError::StaleDock { buffer }) => assert_eq!(buffer.len(), 4),
                    other => panic!("expected a stale rejection, got {other:?}"),
                }
                assert!(!server.operation_active(dock, Direction::Read));
                false
            },
        )
        .unwrap();

    let client = thread::spawn(move || {
        let _stream = connect(port);
    });

    server.run().unwrap();
    client.join().unwrap();
}

#[test]
fn capacity_is_enforced() {
    init_logging();
    let mut server = Server::create().unwrap();
    server.bind_sockets(0);
    let listener = server.create_socket(0).unwrap();
    let result = server.create_acceptor(
        listener,
        |_: &mut Server, _: ErrorCode, _: &mut Accepted, _: Ipv4Address| true,
    );
    match result {
        Err(FatalError::Capacity { capacity: 0 }) => {}
        other => panic!("expected a capacity rejection, got {other:?}"),
    }
}

#[test]
fn layout_queries_report_real_storage() {
    assert_eq!(Server::size(), std::mem::size_of::<Server>());
    assert_eq!(Server::alignment(), std::mem::align_of::<Server>());
    assert!(Server::alignment().is_power_of_two());
    assert_eq!(Socket::size(), std::mem::size_of::<Socket>());
    assert_eq!(Socket::alignment(), std::mem::align_of::<Socket>());
    assert!(Socket::alignment().is_power_of_two());
    assert!(Server::acceptor_size() > 0);
    assert!(Server::dock_size() > 0);
}
