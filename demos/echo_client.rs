//! Counterpart to the echo server: sends a message every second and
//! prints whatever comes back.

use std::sync::Arc;

use nio::{
    Buffer, ChannelContext, Duration, EventLoopGroup, Handler, TcpClient, Timestamp,
};

struct Printer;

impl Handler for Printer {
    fn on_read(&self, _now: Timestamp, buffer: &mut Buffer) {
        print!("{}", String::from_utf8_lossy(&buffer.take()));
    }

    fn on_close(&self, _now: Timestamp) {
        println!("server went away");
        std::process::exit(0);
    }
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let group = Arc::new(EventLoopGroup::new(1)?);

    let client = TcpClient::new("127.0.0.1:1082".parse().unwrap());
    client.set_group(Arc::clone(&group));
    client.set_builder(|_ctx: Arc<ChannelContext>| Arc::new(Printer));
    client.start();

    let sender = Arc::clone(&client);
    group.next().schedule_every(Duration::from_secs(1), Duration::from_secs(1), move || {
        sender.send(format!("hello at {:?}\n", Timestamp::now()));
    });

    group.join();
    Ok(())
}
