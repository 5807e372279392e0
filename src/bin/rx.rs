//! The receiver: joins the multicast group and reflashes the local NAND from
//! the packet stream.

use std::fs::File;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Args, Parser};
use nix::sys::signal::{signal, SigHandler, Signal};

#[cfg(target_os = "linux")]
use nandblast::nand::mtd::MtdNand;
use nandblast::{
    crypto::Sha2Crypto,
    nand::{Nand, NandLayout, SimNand},
    session::{Session, SessionConfig, SessionReport},
    transport::UdpSource,
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate
    #[clap(long)]
    sim_layout: Option<NandLayout>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                sim.load(&mut File::open(path)?)?;
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev)?
                    } else {
                        unreachable!()
                    }
                };

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, nand: NandImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let NandImpl::Sim(mut sim_nand) = nand {
                    sim_nand.save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to reflash
    #[clap(flatten)]
    nand: NandOptions,

    /// Multicast group to join
    #[clap(long, default_value = "239.255.1.2")]
    group: Ipv4Addr,

    #[clap(long, default_value_t = 17788)]
    port: u16,

    /// Address of the local interface to receive on
    #[clap(long, default_value = "0.0.0.0")]
    iface: Ipv4Addr,

    /// Refuse streams without a signed placement spec
    #[clap(long)]
    secure: bool,

    /// Flash write granularity in bytes (default: one erase block)
    #[clap(long)]
    write_chunk: Option<usize>,

    /// Where to store the opaque-image spec blob, if the stream carries one
    #[clap(long)]
    zdata_spec_out: Option<PathBuf>,
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: nix::libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

fn receive<N: Nand>(nand: &mut N, args: &Cli) -> Result<SessionReport> {
    let config = SessionConfig {
        secure: args.secure,
        write_chunk_size: args
            .write_chunk
            .unwrap_or_else(|| nand.get_layout().block_size()),
    };
    let session = Session::new(nand, &STOP, &Sha2Crypto, config)?;

    let mut source = UdpSource::open(args.group, args.port, args.iface)?;
    Ok(session.run(&mut source)?)
}

fn main() -> Result<()> {
    let args = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    howudoin::init(howudoin::consumers::TermLine::default());

    unsafe {
        signal(Signal::SIGINT, SigHandler::Handler(on_sigint))?;
    }

    let mut nand = args.nand.open()?;
    let report = match &mut nand {
        NandImpl::Sim(nand) => receive(nand, &args)?,

        #[cfg(target_os = "linux")]
        NandImpl::Mtd(nand) => receive(nand, &args)?,
    };
    args.nand.cleanup(nand)?;

    let stats = report.stats;
    println!(
        "Packets: {} received, {} duplicates, {} ignored, {} bad CRC, {} missed, {} runts",
        stats.total_pkts, stats.duplicates, stats.ignored, stats.bad_crc, stats.missed, stats.runts
    );

    if let Some(blob) = report.zdata_spec {
        match &args.zdata_spec_out {
            Some(path) => File::create(path)?.write_all(blob.image())?,
            None => println!("Stream carried a spec blob; pass --zdata-spec-out to keep it"),
        }
    }

    Ok(())
}
