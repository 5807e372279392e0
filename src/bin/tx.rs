//! The sender: erasure-codes a NAND image and multicasts it.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;

use nandblast::{
    sender::{ImageSender, SenderOptions},
    transport::{PacketSink, UdpSink},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The image to send
    image: PathBuf,

    /// Multicast group to send to
    #[clap(long, default_value = "239.255.1.2")]
    group: Ipv4Addr,

    #[clap(long, default_value_t = 17788)]
    port: u16,

    /// Address of the local interface to send from
    #[clap(long, default_value = "0.0.0.0")]
    iface: Ipv4Addr,

    #[clap(long, default_value_t = 3)]
    ttl: u32,

    /// Erase-block size of the target devices, in bytes
    #[clap(long, default_value_t = 0x20000)]
    block_size: usize,

    /// Extra symbols per block, as a percentage of the data symbols
    #[clap(long, default_value_t = 60)]
    redundancy: u32,

    /// Opaque-image mode: receivers park the image at the end of the device
    #[clap(long)]
    zdata: bool,

    /// Ask receivers to clean-mark the unused rest of the device
    #[clap(long)]
    cleanmarkers: bool,

    /// Send all symbols of a block back-to-back
    #[clap(long)]
    block_mode: bool,

    /// Placement spec file to interleave with the stream
    #[clap(long)]
    spec: Option<PathBuf>,

    /// Detached signature over the spec
    #[clap(long, requires = "spec")]
    signature: Option<PathBuf>,

    /// How many times to repeat the image
    #[clap(long, default_value_t = 10)]
    passes: u32,

    /// Throttle to this many packets per second (0 = unthrottled)
    #[clap(long, default_value_t = 0)]
    pps: u32,
}

/// Paces an inner sink to a fixed packet rate.
struct Throttled<K> {
    inner: K,
    interval: Duration,
    next: Instant,
}

impl<K> Throttled<K> {
    fn new(inner: K, pps: u32) -> Self {
        Self {
            inner,
            interval: Duration::from_secs(1) / pps.max(1),
            next: Instant::now(),
        }
    }
}

impl<K: PacketSink> PacketSink for Throttled<K> {
    fn send(&mut self, pkt: &[u8]) -> Result<()> {
        let now = Instant::now();
        if now < self.next {
            std::thread::sleep(self.next - now);
        }
        self.next = Instant::now().max(self.next) + self.interval;
        self.inner.send(pkt)
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let image = std::fs::read(&args.image)?;
    let opts = SenderOptions {
        block_size: args.block_size,
        redundancy: args.redundancy,
        zdata: args.zdata,
        cleanmarkers: args.cleanmarkers,
        block_grouped: args.block_mode,
    };

    let mut sender = ImageSender::new(image, &opts)?;
    if let Some(spec) = &args.spec {
        let signature = match &args.signature {
            Some(path) => std::fs::read(path)?,
            None => Vec::new(),
        };
        sender = sender.with_spec(std::fs::read(spec)?, signature);
    }

    let mut sink = UdpSink::open(args.group, args.port, args.iface, args.ttl)?;
    if args.pps > 0 {
        sender.run(&mut Throttled::new(sink, args.pps), args.passes)
    } else {
        sender.run(&mut sink, args.passes)
    }
}
