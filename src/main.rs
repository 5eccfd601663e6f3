//! Binary entry point for the `pigdo` command-line tool.
//!
//! Loads the recipe (fetching and gunzipping it if necessary), applies
//! `-m` mirror mappings, resolves the template and image locations,
//! parses the DESC index, and hands everything to the reassembly
//! engine. Any failure ends with a `Reconstruction failed!` line on
//! stderr and a non-zero exit code.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;

use pigdo::assemble::{assemble, AssembleOptions, DEFAULT_WORKERS};
use pigdo::decompress::gunzip_replace;
use pigdo::fetch::{uri_scheme, Fetcher};
use pigdo::md5sum::md5_file;
use pigdo::progress::{install_dump_signal, set_verbosity, verbosity, Verbosity};
use pigdo::recipe::Recipe;
use pigdo::template::read_desc_table;

#[derive(Parser, Debug)]
#[command(
    name = "pigdo",
    version,
    about = "Reassemble a disc image from a jigdo recipe, template, and mirrors"
)]
struct Args {
    /// Path or URI of the .jigdo recipe file
    jigdo: String,

    /// Where the reconstructed image is written.
    /// Default: the filename declared in the recipe, beside a local
    /// recipe or in the current directory for a remote one
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Path or URI of the .template file.
    /// Default: the template declared in the recipe, resolved the same
    /// way as the image
    #[arg(short, long)]
    template: Option<String>,

    /// Number of simultaneous download threads
    #[arg(short = 'j', long = "threads", default_value_t = DEFAULT_WORKERS)]
    threads: usize,

    /// Map a mirror name to a URI or local path (repeatable)
    #[arg(short, long = "mirror", value_name = "NAME=URI-OR-DIR")]
    mirror: Vec<String>,

    /// Only report errors
    #[arg(short, long)]
    quiet: bool,

    /// Increase verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,
}

/// Directory that recipe-relative names resolve against.
fn recipe_dir(jigdo: &str) -> PathBuf {
    if uri_scheme(jigdo).is_some() {
        return PathBuf::from(".");
    }
    match Path::new(jigdo).parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    if args.threads < 1 {
        bail!("--threads must be at least 1");
    }

    install_dump_signal().context("installing the status-dump signal handler")?;
    let fetcher = Arc::new(Fetcher::new()?);

    // The recipe itself may live on a mirror and may be gzipped.
    let recipe_file = fetcher
        .open(&args.jigdo)
        .with_context(|| format!("opening recipe '{}'", args.jigdo))?;
    let recipe_file = gunzip_replace(recipe_file)?;
    let mut recipe = Recipe::parse(BufReader::new(recipe_file))
        .with_context(|| format!("reading recipe '{}'", args.jigdo))?;

    if verbosity() >= Verbosity::Progress {
        println!("Successfully read jigdo file for '{}'", recipe.image_name);
        println!("Template filename is: {}", recipe.template_name);
        if let Some(md5) = recipe.template_md5 {
            println!("Template MD5 sum is: {md5}");
        }
    }

    for spec in &args.mirror {
        recipe
            .add_mirror(spec)
            .with_context(|| format!("invalid mirror specification '{spec}'"))?;
    }

    let base = recipe_dir(&args.jigdo);

    let template_loc = match &args.template {
        Some(t) => t.clone(),
        None => {
            let name = &recipe.template_name;
            if uri_scheme(name).is_some() || Path::new(name).is_absolute() {
                name.clone()
            } else {
                base.join(name).to_string_lossy().into_owned()
            }
        }
    };

    let mut template = fetcher
        .open(&template_loc)
        .with_context(|| format!("opening template '{template_loc}'"))?;

    if let Some(want) = recipe.template_md5 {
        let got = md5_file(&template)?;
        if got != want {
            bail!("template checksum is {got}, but the recipe declares {want}");
        }
    }

    let table = read_desc_table(&mut template)
        .with_context(|| format!("reading the DESC table of '{template_loc}'"))?;
    if verbosity() >= Verbosity::Progress {
        println!("Image size is: {} bytes", table.image_info.size);
        println!("Image md5sum is: {}", table.image_info.md5);
    }

    let image_path = match &args.output {
        Some(p) => p.clone(),
        None => base.join(&recipe.image_name),
    };

    let opts = AssembleOptions {
        workers: args.threads,
        ..AssembleOptions::default()
    };
    assemble(
        Arc::new(recipe),
        table,
        &mut template,
        &image_path,
        fetcher,
        &opts,
    )?;
    Ok(())
}

fn main() {
    let args = Args::parse();

    set_verbosity(Verbosity::from_flags(args.quiet, args.verbose));

    if let Err(e) = run(&args) {
        if verbosity() >= Verbosity::Errors {
            eprintln!("pigdo: {e:#}");
        }
        eprintln!("Reconstruction failed!");
        std::process::exit(1);
    }
}
