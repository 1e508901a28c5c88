//! User-drawn markers: sparse sets of labeled voxels on training images.
use crate::{
    flim_errors::{FlimError, FlimResult},
    multiband_image::{MultibandImage, Voxel},
};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

pub type Label = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Marker {
    pub voxel: Voxel,
    pub label: Label,
}

/// Markers of one image, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkerSet {
    markers: Vec<Marker>,
}

impl MarkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_markers(markers: Vec<Marker>) -> Self {
        Self { markers }
    }

    pub fn push(&mut self, voxel: Voxel, label: Label) {
        self.markers.push(Marker { voxel, label });
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Marker> {
        self.markers.iter()
    }

    /// Distinct labels in ascending order.
    pub fn labels(&self) -> Vec<Label> {
        self.by_class().keys().copied().collect()
    }

    /// Marked voxels grouped by label, labels ascending, voxels in insertion order.
    pub fn by_class(&self) -> BTreeMap<Label, Vec<Voxel>> {
        let mut classes: BTreeMap<Label, Vec<Voxel>> = BTreeMap::new();
        for marker in &self.markers {
            classes.entry(marker.label).or_default().push(marker.voxel);
        }
        classes
    }

    /// Same as `by_class`, keeping only voxels inside the image domain.
    pub fn by_class_within(&self, image: &MultibandImage) -> BTreeMap<Label, Vec<Voxel>> {
        let mut classes = self.by_class();
        for voxels in classes.values_mut() {
            voxels.retain(|v| image.contains(v));
        }
        classes
    }

    /// Applies `f` to every voxel and drops repeated (voxel, label) pairs,
    /// keeping the first occurrence.
    pub fn map_voxels<F>(&self, f: F) -> MarkerSet
    where
        F: Fn(&Voxel) -> Voxel,
    {
        let mut seen = std::collections::HashSet::new();
        let markers = self
            .markers
            .iter()
            .map(|m| Marker {
                voxel: f(&m.voxel),
                label: m.label,
            })
            .filter(|m| seen.insert(*m))
            .collect();
        MarkerSet { markers }
    }

    /// Reads markers in the plain text format: an optional first line holding
    /// only the marker count, then `x y label` or `x y z label` per line.
    pub fn from_reader<R: BufRead>(reader: R) -> FlimResult<Self> {
        let mut set = MarkerSet::new();
        let mut first_entry = true;
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            let format_error = |reason: String| FlimError::MarkerFormatError {
                line: number + 1,
                reason,
            };
            let coord = |field: &str| {
                field
                    .parse::<usize>()
                    .map_err(|e| format_error(format!("coordinate {:?}: {}", field, e)))
            };
            let label = |field: &str| {
                field
                    .parse::<Label>()
                    .map_err(|e| format_error(format!("label {:?}: {}", field, e)))
            };
            match fields.as_slice() {
                &[count] if first_entry => {
                    coord(count)?;
                }
                &[x, y, l] => set.push(Voxel::new_2d(coord(x)?, coord(y)?), label(l)?),
                &[x, y, z, l] => {
                    let voxel = Voxel::new(coord(x)?, coord(y)?, coord(z)?);
                    set.push(voxel, label(l)?)
                }
                _ => {
                    return Err(format_error(format!(
                        "expected 3 or 4 fields, found {}",
                        fields.len()
                    )))
                }
            }
            first_entry = false;
        }
        Ok(set)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> FlimResult<Self> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    /// Writes the markers in the format read by `from_reader`, with the count
    /// on the first line. `is_3d` selects `x y z label` lines.
    pub fn write_to<W: Write>(&self, mut writer: W, is_3d: bool) -> FlimResult<()> {
        writeln!(writer, "{}", self.markers.len())?;
        for m in &self.markers {
            if is_3d {
                writeln!(writer, "{} {} {} {}", m.voxel.x, m.voxel.y, m.voxel.z, m.label)?;
            } else {
                writeln!(writer, "{} {} {}", m.voxel.x, m.voxel.y, m.label)?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P, is_3d: bool) -> FlimResult<()> {
        self.write_to(BufWriter::new(File::create(path)?), is_3d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_markers() {
        let text = "4\n1 2 1\n3 4 2\n\n# comment\n5 6 1\n1 1 1 2\n";
        let set = MarkerSet::from_reader(Cursor::new(text)).unwrap();
        assert_eq!(set.len(), 4);
        assert_eq!(set.labels(), vec![1, 2]);
        let classes = set.by_class();
        assert_eq!(classes[&1], vec![Voxel::new_2d(1, 2), Voxel::new_2d(5, 6)]);
        assert_eq!(classes[&2], vec![Voxel::new_2d(3, 4), Voxel::new(1, 1, 1)]);
    }

    #[test]
    fn test_read_markers_without_header() {
        let set = MarkerSet::from_reader(Cursor::new("0 0 3\n")).unwrap();
        assert_eq!(set.labels(), vec![3]);
    }

    #[test]
    fn test_malformed_line_is_reported() {
        let err = MarkerSet::from_reader(Cursor::new("2\n1 2\n")).unwrap_err();
        assert!(matches!(err, FlimError::MarkerFormatError { line: 2, .. }));
        let err = MarkerSet::from_reader(Cursor::new("1 x 2\n")).unwrap_err();
        assert!(matches!(err, FlimError::MarkerFormatError { line: 1, .. }));
        let err = MarkerSet::from_reader(Cursor::new("1\n1 2 4294967296\n")).unwrap_err();
        assert!(matches!(err, FlimError::MarkerFormatError { line: 2, .. }));
    }

    #[test]
    fn test_map_voxels_collapses_duplicates() {
        let mut set = MarkerSet::new();
        set.push(Voxel::new_2d(2, 2), 1);
        set.push(Voxel::new_2d(3, 3), 1);
        set.push(Voxel::new_2d(3, 3), 2);
        let halved = set.map_voxels(|v| Voxel::new_2d(v.x / 2, v.y / 2));
        assert_eq!(halved.len(), 2);
        assert_eq!(halved.labels(), vec![1, 2]);
    }

    #[test]
    fn test_written_markers_read_back() {
        let mut set = MarkerSet::new();
        set.push(Voxel::new_2d(4, 1), 2);
        set.push(Voxel::new_2d(0, 3), 1);
        let mut buffer = Vec::new();
        set.write_to(&mut buffer, false).unwrap();
        assert_eq!(String::from_utf8(buffer.clone()).unwrap(), "2\n4 1 2\n0 3 1\n");
        assert_eq!(MarkerSet::from_reader(Cursor::new(buffer)).unwrap(), set);
    }

    #[test]
    fn test_out_of_domain_voxels_are_dropped() {
        let mut set = MarkerSet::new();
        set.push(Voxel::new_2d(0, 0), 1);
        set.push(Voxel::new_2d(9, 0), 2);
        let img = MultibandImage::zeros(4, 4, 1, 1);
        let classes = set.by_class_within(&img);
        assert_eq!(classes[&1].len(), 1);
        assert!(classes[&2].is_empty());
    }
}
