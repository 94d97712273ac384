use clap::{Parser, Subcommand};
use env_logger::Env;
use std::{path::PathBuf, process};

use imagegen::{BootImage, Header, IntSection};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the header, string info and section layout of an image
    Inspect {
        #[arg(help = "The boot image file")]
        image: PathBuf,
    },
    /// Run every load-time check on an image
    Verify {
        #[arg(help = "The boot image file")]
        image: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let path = match &cli.command {
        Command::Inspect { image } | Command::Verify { image } => image,
    };
    let image = match BootImage::read_from_file(path) {
        Ok(image) => image,
        Err(err) => {
            eprintln!("Error reading image '{}': {}", path.display(), err);
            process::exit(1);
        }
    };

    match cli.command {
        Command::Inspect { .. } => inspect(&image),
        Command::Verify { .. } => {
            log::info!(
                "{} is a valid image ({} bytes, randomID {})",
                path.display(),
                image.file_size(),
                image.header.random_id
            );
        }
    }
}

fn inspect(image: &BootImage) {
    println!("== header ({} bytes) ==", Header::size());
    print!("{}", image.header);

    println!("== string info ({} bytes) ==", image.string_info.size());
    for (key, value) in &image.string_info.values {
        println!("{key}: {value}");
    }

    println!("== sections ==");
    let sections = [
        ("relocation data", image.relocation_data_offset(), image.relocation_data.len()),
        ("padding", image.padding_offset(), image.padding_size()),
        ("heap", image.heap_offset(), image.heap.len()),
        ("code", image.code_offset(), image.code.len()),
        ("trailer", image.trailer_offset(), imagegen::Trailer::size()),
    ];
    for (name, offset, size) in sections {
        println!("{name:<16} {offset:#010x} {size:>10}");
    }

    let map = image.relocation_map();
    let word = image.header.word_size as usize;
    let words = (image.heap.len() + image.code.len()) / word;
    let heap_words = image.heap.len() / word;
    let in_heap = map.marked_words().take_while(|&w| w < heap_words).count();
    println!("== relocation ==");
    println!("{} of {} words marked", map.count(), words);
    println!("heap: {in_heap}, code: {}", map.count() - in_heap);
}
