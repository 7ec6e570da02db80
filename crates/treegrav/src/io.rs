//! Field-file ingest and output.
//!
//! Particle fields live in XDR-style big-endian binary files: a
//! [`FieldHeader`], the field's min and max values, then one value per
//! particle. Masses come from `<base>.mass` (dimension 1, float32) and
//! positions from `<base>.pos` (dimension 3, float32); a file whose min
//! and max are equal stores no body and every particle takes that value.
//! Outputs reuse the same layout with float64 or uint32 bodies.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::error::{GravityError, Result};
use crate::particle::GravityParticle;
use crate::space::OrientedBox;

pub const FIELD_MAGIC: u32 = 1_062_053;

/// XDR type codes for the payload values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeCode {
    Uint32 = 6,
    Float32 = 9,
    Float64 = 10,
}

impl TypeCode {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            6 => Some(TypeCode::Uint32),
            9 => Some(TypeCode::Float32),
            10 => Some(TypeCode::Float64),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FieldHeader {
    pub time: f64,
    pub num_particles: u64,
    pub dimensions: u32,
    pub code: TypeCode,
}

fn io_err(path: &Path, source: std::io::Error) -> GravityError {
    GravityError::Io {
        piece: 0,
        path: path.display().to_string(),
        source,
    }
}

fn corrupt(path: &Path, reason: impl Into<String>) -> GravityError {
    GravityError::CorruptField {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

fn read_u32(r: &mut impl Read, path: &Path) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(|e| io_err(path, e))?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(r: &mut impl Read, path: &Path) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(|e| io_err(path, e))?;
    Ok(u64::from_be_bytes(buf))
}

fn read_f32(r: &mut impl Read, path: &Path) -> Result<f32> {
    Ok(f32::from_bits(read_u32(r, path)?))
}

fn read_f64(r: &mut impl Read, path: &Path) -> Result<f64> {
    Ok(f64::from_bits(read_u64(r, path)?))
}

pub fn read_header(r: &mut impl Read, path: &Path) -> Result<FieldHeader> {
    let magic = read_u32(r, path)?;
    if magic != FIELD_MAGIC {
        return Err(corrupt(path, format!("bad magic {magic:#x}")));
    }
    let time = read_f64(r, path)?;
    let num_particles = read_u64(r, path)?;
    let dimensions = read_u32(r, path)?;
    let code = read_u32(r, path)?;
    let code = TypeCode::from_u32(code).ok_or_else(|| corrupt(path, format!("unknown type code {code}")))?;
    Ok(FieldHeader {
        time,
        num_particles,
        dimensions,
        code,
    })
}

fn write_header(w: &mut impl Write, h: &FieldHeader, path: &Path) -> Result<()> {
    let mut buf = Vec::with_capacity(28);
    buf.extend_from_slice(&FIELD_MAGIC.to_be_bytes());
    buf.extend_from_slice(&h.time.to_bits().to_be_bytes());
    buf.extend_from_slice(&h.num_particles.to_be_bytes());
    buf.extend_from_slice(&h.dimensions.to_be_bytes());
    buf.extend_from_slice(&(h.code as u32).to_be_bytes());
    w.write_all(&buf).map_err(|e| io_err(path, e))
}

/// Even split of `total` particles over `pieces`, overflow going to the
/// lowest piece indices: piece `i` takes one extra when `i < total %
/// pieces`.
pub fn piece_slice(total: usize, pieces: usize, index: usize) -> (usize, usize) {
    let base = total / pieces;
    let excess = total % pieces;
    let count = base + usize::from(index < excess);
    let start = index * base + index.min(excess);
    (start, count)
}

/// Read `<base>.mass` and `<base>.pos` and deal the particles out to
/// pieces in contiguous SFC-file order. Returns the global bounding box
/// from the position file bounds.
/// `<base>.<ext>`, appending rather than replacing any existing
/// extension in the base name.
pub fn field_path(base: &Path, ext: &str) -> std::path::PathBuf {
    std::path::PathBuf::from(format!("{}.{ext}", base.display()))
}

pub fn load_particles(
    base: &Path,
    num_pieces: usize,
) -> Result<(f64, OrientedBox, Vec<Vec<GravityParticle>>)> {
    let mass_path = field_path(base, "mass");
    let file = File::open(&mass_path).map_err(|e| io_err(&mass_path, e))?;
    let mut r = BufReader::new(file);
    let mass_header = read_header(&mut r, &mass_path)?;
    if mass_header.dimensions != 1 || mass_header.code != TypeCode::Float32 {
        return Err(corrupt(&mass_path, "expected dimension-1 float32 masses"));
    }
    let total = mass_header.num_particles as usize;
    info!(total, "loading particles");

    let min_mass = read_f32(&mut r, &mass_path)?;
    let max_mass = read_f32(&mut r, &mass_path)?;
    let masses: Vec<f32> = if min_mass == max_mass {
        vec![min_mass; total]
    } else {
        let mut m = Vec::with_capacity(total);
        for _ in 0..total {
            m.push(read_f32(&mut r, &mass_path)?);
        }
        m
    };
    drop(r);

    let pos_path = field_path(base, "pos");
    let file = File::open(&pos_path).map_err(|e| io_err(&pos_path, e))?;
    let mut r = BufReader::new(file);
    let pos_header = read_header(&mut r, &pos_path)?;
    if pos_header.dimensions != 3 || pos_header.code != TypeCode::Float32 {
        return Err(corrupt(&pos_path, "expected dimension-3 float32 positions"));
    }
    if pos_header.num_particles != mass_header.num_particles || pos_header.time != mass_header.time
    {
        return Err(GravityError::MismatchedFields {
            reason: format!(
                "{} and {} disagree on particle count or time",
                mass_path.display(),
                pos_path.display()
            ),
        });
    }

    let mut lo = [0f64; 3];
    let mut hi = [0f64; 3];
    for v in &mut lo {
        *v = read_f32(&mut r, &pos_path)? as f64;
    }
    for v in &mut hi {
        *v = read_f32(&mut r, &pos_path)? as f64;
    }
    let bbox = OrientedBox::new(lo, hi);

    let positions: Vec<[f32; 3]> = if lo == hi {
        vec![[lo[0] as f32, lo[1] as f32, lo[2] as f32]; total]
    } else {
        let mut ps = Vec::with_capacity(total);
        for _ in 0..total {
            let x = read_f32(&mut r, &pos_path)?;
            let y = read_f32(&mut r, &pos_path)?;
            let z = read_f32(&mut r, &pos_path)?;
            ps.push([x, y, z]);
        }
        ps
    };

    let mut per_piece = Vec::with_capacity(num_pieces);
    for piece in 0..num_pieces {
        let (start, count) = piece_slice(total, num_pieces, piece);
        debug!(piece, start, count, "assigned particle range");
        let block = (start..start + count)
            .map(|i| GravityParticle::new(positions[i], masses[i], 0.0))
            .collect();
        per_piece.push(block);
    }
    Ok((mass_header.time, bbox, per_piece))
}

/// Write a 3-vector float64 field (accelerations), header then the grown
/// bounds then the body.
pub fn write_vector_field(path: &Path, time: f64, values: &[[f64; 3]]) -> Result<()> {
    let file = File::create(path).map_err(|e| io_err(path, e))?;
    let mut w = BufWriter::new(file);
    write_header(
        &mut w,
        &FieldHeader {
            time,
            num_particles: values.len() as u64,
            dimensions: 3,
            code: TypeCode::Float64,
        },
        path,
    )?;
    let mut bounds = OrientedBox::empty();
    for v in values {
        bounds.grow(*v);
    }
    for corner in [bounds.lesser, bounds.greater] {
        for c in corner {
            w.write_all(&c.to_bits().to_be_bytes()).map_err(|e| io_err(path, e))?;
        }
    }
    for v in values {
        for c in v {
            w.write_all(&c.to_bits().to_be_bytes()).map_err(|e| io_err(path, e))?;
        }
    }
    w.flush().map_err(|e| io_err(path, e))
}

/// Write a scalar uint32 counter field (walk statistics).
pub fn write_u32_field(path: &Path, time: f64, values: &[u32]) -> Result<()> {
    let file = File::create(path).map_err(|e| io_err(path, e))?;
    let mut w = BufWriter::new(file);
    write_header(
        &mut w,
        &FieldHeader {
            time,
            num_particles: values.len() as u64,
            dimensions: 1,
            code: TypeCode::Uint32,
        },
        path,
    )?;
    let min = values.iter().min().copied().unwrap_or(0);
    let max = values.iter().max().copied().unwrap_or(0);
    for v in [min, max] {
        w.write_all(&v.to_be_bytes()).map_err(|e| io_err(path, e))?;
    }
    for v in values {
        w.write_all(&v.to_be_bytes()).map_err(|e| io_err(path, e))?;
    }
    w.flush().map_err(|e| io_err(path, e))
}

/// Write a scalar float64 field (relative errors).
pub fn write_f64_field(path: &Path, time: f64, values: &[f64]) -> Result<()> {
    let file = File::create(path).map_err(|e| io_err(path, e))?;
    let mut w = BufWriter::new(file);
    write_header(
        &mut w,
        &FieldHeader {
            time,
            num_particles: values.len() as u64,
            dimensions: 1,
            code: TypeCode::Float64,
        },
        path,
    )?;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    for v in [min, max] {
        w.write_all(&v.to_bits().to_be_bytes()).map_err(|e| io_err(path, e))?;
    }
    for v in values {
        w.write_all(&v.to_bits().to_be_bytes()).map_err(|e| io_err(path, e))?;
    }
    w.flush().map_err(|e| io_err(path, e))
}

/// ASCII variant: particle count on the first line, then each component
/// on its own line, x, y, z per particle.
pub fn write_vector_field_ascii(path: &Path, values: &[[f64; 3]]) -> Result<()> {
    let file = File::create(path).map_err(|e| io_err(path, e))?;
    let mut w = BufWriter::new(file);
    writeln!(w, "{}", values.len()).map_err(|e| io_err(path, e))?;
    for v in values {
        for c in v {
            writeln!(w, "{c:.14e}").map_err(|e| io_err(path, e))?;
        }
    }
    w.flush().map_err(|e| io_err(path, e))
}
