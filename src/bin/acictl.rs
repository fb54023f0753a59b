//! Command-line tool for inspecting and extracting manifest + rootfs images.

use std::{
    io::Write,
    path::PathBuf,
    process::ExitCode,
};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use aci_image::{archive::ExtractOptions, Image, Validity};

/// acictl
#[derive(Debug, Parser)]
#[clap(name = "acictl", version)]
pub struct App {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Lists the rootfs contents of an image, one path per line
    Ls {
        /// the image archive
        image: PathBuf,
    },
    /// Checks that an image has exactly one manifest and only rootfs contents otherwise
    Validate {
        /// the image archive
        image: PathBuf,
    },
    /// Writes the raw manifest of an image to stdout
    Manifest {
        /// the image archive
        image: PathBuf,
    },
    /// Extracts the rootfs of an image into a directory
    Extract {
        /// the image archive
        image: PathBuf,
        /// the directory to extract into
        target: PathBuf,
        /// Refuse to extract images that fail validation
        #[clap(long)]
        validate: bool,
        /// Don't restore permissions exactly, apply the umask instead
        #[clap(long)]
        no_same_permissions: bool,
        /// Don't restore modification times
        #[clap(long)]
        no_same_time: bool,
        /// Restore file ownership
        #[clap(long)]
        same_owner: bool,
    },
}

fn main() -> Result<ExitCode> {
    env_logger::init();

    let args = App::parse();

    match args.cmd {
        Command::Ls { ref image } => {
            let mut stdout = std::io::stdout().lock();
            for path in Image::new(image).list_rootfs_files()? {
                writeln!(stdout, "{}", path.display())?;
            }
        }
        Command::Validate { ref image } => match Image::new(image).validate_structure() {
            Validity::Valid => println!("valid"),
            Validity::Invalid(reason) => {
                println!("invalid: {reason}");
                return Ok(ExitCode::FAILURE);
            }
        },
        Command::Manifest { ref image } => {
            let manifest = Image::new(image).read_manifest()?;
            std::io::stdout().write_all(&manifest)?;
        }
        Command::Extract {
            ref image,
            ref target,
            validate,
            no_same_permissions,
            no_same_time,
            same_owner,
        } => {
            let image = Image::new(image);
            if validate {
                if let Validity::Invalid(reason) = image.validate_structure() {
                    bail!("{}: {reason}", image.path().display());
                }
            }
            let options = ExtractOptions {
                time: !no_same_time,
                perm: !no_same_permissions,
                owner: same_owner,
            };
            image.extract_rootfs_with(target, options)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}
