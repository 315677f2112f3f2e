//! A multi-loop echo server.
//!
//! Run with `cargo run --example echo_server`, then connect with
//! `nc 127.0.0.1 1082` and type away.

use std::sync::Arc;

use nio::{Buffer, ChannelContext, EventLoopGroup, Handler, TcpServer, Timestamp};

struct Echo(Arc<ChannelContext>);

impl Handler for Echo {
    fn on_connect(&self, _now: Timestamp) {
        if let Some(conn) = self.0.connection() {
            println!("connected: {:?}", conn.peer_address());
        }
    }

    fn on_read(&self, _now: Timestamp, buffer: &mut Buffer) {
        if let Some(conn) = self.0.connection() {
            conn.send(buffer.take());
        }
    }

    fn on_close(&self, _now: Timestamp) {
        println!("disconnected");
    }
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let group = Arc::new(EventLoopGroup::new(4)?);

    let mut server = TcpServer::new();
    server.set_group(Arc::clone(&group), Arc::clone(&group));
    server.set_builder(|ctx| Arc::new(Echo(ctx)));
    server.bind("127.0.0.1:1082".parse().unwrap())?;
    server.start();

    println!("echo server listening on {:?}", server.local_addr());
    group.join();
    Ok(())
}
