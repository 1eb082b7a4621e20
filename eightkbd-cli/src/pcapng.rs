//! pcapng capture reader: feeds Enhanced Packet blocks to the URB
//! reconstructor and prints one decoded line per URB, deduplicating runs of
//! identical interrupt traffic.

use std::fs::File;
use std::io::{BufReader, Write as IoWrite};
use std::path::Path;

use anyhow::{Context, Result};
use pcap_file::pcapng::{Block, PcapNgReader};

use eightkbd_proto::urb::{DedupEmitter, UsbContext};

pub struct ScanOptions<'a> {
    pub verbose: bool,
    pub count: i64,
    pub load_state: Option<&'a Path>,
    pub save_state: Option<&'a Path>,
}

fn load_state(path: &Path) -> Result<Vec<Vec<u8>>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut state = Vec::new();
    for line in text.lines() {
        let bytes: Result<Vec<u8>, _> =
            line.split_whitespace().map(|tok| u8::from_str_radix(tok, 16)).collect();
        state.push(bytes.with_context(|| format!("parsing state line {line:?}"))?);
    }
    Ok(state)
}

fn save_state(path: &Path, state: &[Vec<u8>]) -> Result<()> {
    let mut out = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    for urb in state {
        let line: Vec<String> = urb.iter().map(|b| format!("{b:02X}")).collect();
        writeln!(out, "{}", line.join(" "))?;
    }
    Ok(())
}

pub fn scan(pcap_path: &Path, options: &ScanOptions) -> Result<()> {
    let mut ctx = UsbContext::new(options.verbose);

    if let Some(load_path) = options.load_state {
        let state = load_state(load_path)?;
        ctx.set_state(&state).context("replaying saved state")?;
        println!("State loaded");
    }

    let file = File::open(pcap_path).with_context(|| format!("opening {}", pcap_path.display()))?;
    let mut reader = PcapNgReader::new(BufReader::new(file)).context("parsing pcapng header")?;

    let mut dedup = DedupEmitter::new();
    let mut interface_names: Vec<String> = Vec::new();
    let mut remaining = options.count;
    let mut seq = 1u64;

    while let Some(block) = reader.next_block() {
        let block = block.context("reading pcapng block")?;
        match block {
            Block::SectionHeader(_) => {
                if options.verbose {
                    println!("Section Header");
                }
            }
            Block::InterfaceDescription(idb) => {
                let name = idb
                    .options
                    .iter()
                    .find_map(|opt| match opt {
                        pcap_file::pcapng::InterfaceDescriptionOption::IfName(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .unwrap_or_default();
                if options.verbose {
                    println!("Interface Description {name}");
                }
                interface_names.push(name);
            }
            Block::EnhancedPacket(epb) => {
                let iface_name = interface_names.get(epb.interface_id as usize).cloned().unwrap_or_default();
                if epb.original_len as usize > epb.data.len() {
                    if options.verbose {
                        println!("{iface_name} {} {}", epb.original_len, epb.data.len());
                    } else {
                        println!("Incomplete packet!");
                    }
                } else if options.verbose {
                    println!("{iface_name} {}", epb.original_len);
                }

                let (_urb, sec, usec, rendered) = ctx.parse_urb(&epb.data).context("decoding URB record")?;
                let line = format!("{seq} {sec}.{usec:06} {rendered}");
                if let Some(to_print) = dedup.push(&line) {
                    println!("{to_print}");
                }
                seq += 1;
            }
            Block::InterfaceStatistics(_) => {}
            _ => {
                println!("Unhandled block type");
                break;
            }
        }

        if remaining >= 0 {
            remaining -= 1;
            if remaining == 0 {
                break;
            }
        }
    }

    if let Some(save_path) = options.save_state {
        save_state(save_path, ctx.get_state())?;
        println!("State saved");
    }

    Ok(())
}
