//! Reader and writer for the `<DICOM>` index document.
//!
//! ```xml
//! <DICOM>
//!   <subject id="P1" checked="False">
//!     <study id="20240101_120000_MR" typeID="" uid="1.2.3" checked="False">
//!       <series id="1_T1w" typeID="" uid="1.2.3.4" checked="False">
//!         <image checked="False">
//!           <label>Image 1</label>
//!           <name>/data/P1/a.dcm</name>
//!           <time>120301</time>
//!           <date>20240101</date>
//!         </image>
//! ```

use std::path::{Path, PathBuf};

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use tracing::warn;

use crate::enums::Level;
use crate::error::{IndexError, Result};
use crate::metadata_index::{IdPath, ImageEntry, MetadataIndex, NodeId};

const ROOT: &str = "DICOM";

fn flag(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

fn parse_flag(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

#[derive(Default)]
struct Attributes {
    id: Option<String>,
    type_id: String,
    uid: String,
    checked: bool,
}

fn attributes(element: &BytesStart<'_>) -> Result<Attributes> {
    let mut attributes = Attributes::default();
    for attribute in element.attributes() {
        let attribute = attribute.map_err(IndexError::parse)?;
        let value = attribute.unescape_value().map_err(IndexError::parse)?.into_owned();
        match attribute.key.as_ref() {
            b"id" => attributes.id = Some(value),
            b"typeID" => attributes.type_id = value,
            b"uid" => attributes.uid = value,
            b"checked" => attributes.checked = parse_flag(&value),
            _ => {}
        }
    }
    Ok(attributes)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    Label,
    Name,
    Time,
    Date,
}

struct PendingImage {
    entry: ImageEntry,
    name: Option<String>,
    checked: bool,
}

/// Parse an index document. `location` becomes the index's save location.
pub(crate) fn read(text: &str, location: &Path) -> Result<MetadataIndex> {
    let mut index = MetadataIndex::new(location);
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut seen_root = false;
    let mut branches: Vec<(IdPath, NodeId)> = Vec::new();
    let mut image: Option<PendingImage> = None;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event().map_err(IndexError::parse)? {
            Event::Start(element) => {
                let name = element.name();
                let name = name.as_ref();
                if !seen_root {
                    if name != ROOT.as_bytes() {
                        return Err(IndexError::parse(format!(
                            "expected <{ROOT}> root, found <{}>",
                            String::from_utf8_lossy(name)
                        )));
                    }
                    seen_root = true;
                    continue;
                }
                match name {
                    b"subject" | b"study" | b"series" => {
                        let level = match name {
                            b"subject" => Level::Subject,
                            b"study" => Level::Study,
                            _ => Level::Series,
                        };
                        open_branch(&mut index, &mut branches, level, &element)?;
                    }
                    b"image" => {
                        if branches.len() != 3 || image.is_some() {
                            return Err(IndexError::parse("<image> outside of a <series>"));
                        }
                        image = Some(PendingImage {
                            entry: ImageEntry::default(),
                            name: None,
                            checked: attributes(&element)?.checked,
                        });
                    }
                    b"label" | b"name" | b"time" | b"date" => {
                        if image.is_none() {
                            return Err(IndexError::parse("image field outside of an <image>"));
                        }
                        field = Some(match name {
                            b"label" => Field::Label,
                            b"name" => Field::Name,
                            b"time" => Field::Time,
                            _ => Field::Date,
                        });
                    }
                    other => {
                        return Err(IndexError::parse(format!(
                            "unexpected element <{}>",
                            String::from_utf8_lossy(other)
                        )));
                    }
                }
            }
            Event::Empty(element) => {
                if !seen_root {
                    if element.name().as_ref() == ROOT.as_bytes() {
                        return Ok(index);
                    }
                    return Err(IndexError::parse("document has no <DICOM> root"));
                }
                // Empty subject/study/series nodes carry no images and are dropped,
                // as are empty image fields.
            }
            Event::Text(text) => {
                if let (Some(pending), Some(field)) = (image.as_mut(), field) {
                    let value = text.unescape().map_err(IndexError::parse)?.into_owned();
                    match field {
                        Field::Label => pending.entry.label = value,
                        Field::Name => pending.name = Some(value),
                        Field::Time => pending.entry.time = value,
                        Field::Date => pending.entry.date = value,
                    }
                }
            }
            Event::End(element) => match element.name().as_ref() {
                b"subject" | b"study" | b"series" => {
                    branches.pop();
                }
                b"image" => {
                    let Some(pending) = image.take() else {
                        return Err(IndexError::parse("unbalanced </image>"));
                    };
                    close_image(&mut index, &branches, pending)?;
                }
                b"label" | b"name" | b"time" | b"date" => field = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(IndexError::parse("document has no <DICOM> root"));
    }
    if !branches.is_empty() || image.is_some() {
        return Err(IndexError::parse("document ended inside an open element"));
    }
    index.prune_empty_branches();
    Ok(index)
}

fn open_branch(
    index: &mut MetadataIndex,
    branches: &mut Vec<(IdPath, NodeId)>,
    level: Level,
    element: &BytesStart<'_>,
) -> Result<()> {
    let expected_depth = match level {
        Level::Subject => 0,
        Level::Study => 1,
        _ => 2,
    };
    if branches.len() != expected_depth {
        return Err(IndexError::parse(format!(
            "<{}> at the wrong depth",
            level.element_name()
        )));
    }
    let attributes = attributes(element)?;
    let Some(id) = attributes.id else {
        return Err(IndexError::parse(format!(
            "<{}> without an id attribute",
            level.element_name()
        )));
    };
    let (path, parent) = match branches.last() {
        Some((parent_path, parent)) => match parent_path.child(id) {
            Some(path) => (path, Some(*parent)),
            None => return Err(IndexError::parse("nesting deeper than <series>")),
        },
        None => (IdPath::subject(id), None),
    };
    let node = index.ensure_branch_checked(
        parent,
        path.clone(),
        &attributes.type_id,
        &attributes.uid,
        attributes.checked,
    );
    branches.push((path, node));
    Ok(())
}

fn close_image(
    index: &mut MetadataIndex,
    branches: &[(IdPath, NodeId)],
    pending: PendingImage,
) -> Result<()> {
    let Some(name) = pending.name else {
        return Err(IndexError::parse("<image> without a <name>"));
    };
    let Some((series_path, series)) = branches.last() else {
        return Err(IndexError::parse("<image> outside of a <series>"));
    };
    let entry = ImageEntry {
        path: PathBuf::from(name),
        ..pending.entry
    };
    let path = entry.path.clone();
    if !index.push_image(*series, entry, pending.checked) {
        warn!(path = %path.display(), series = %series_path, "duplicate image entry ignored");
    }
    Ok(())
}

/// Serialize the index into a complete document.
pub(crate) fn write(index: &MetadataIndex) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    emit(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    emit(&mut writer, Event::Start(BytesStart::new(ROOT)))?;
    for &subject in index.subjects() {
        write_node(&mut writer, index, subject)?;
    }
    emit(&mut writer, Event::End(BytesEnd::new(ROOT)))?;
    Ok(writer.into_inner())
}

fn write_node(writer: &mut Writer<Vec<u8>>, index: &MetadataIndex, id: NodeId) -> Result<()> {
    let Some(node) = index.node(id) else {
        return Ok(());
    };
    let tag = node.level().element_name();
    let mut start = BytesStart::new(tag);

    if let Some(entry) = node.image() {
        start.push_attribute(("checked", flag(node.checked())));
        emit(writer, Event::Start(start))?;
        let name = entry.path.to_string_lossy();
        for (field, value) in [
            ("label", entry.label.as_str()),
            ("name", name.as_ref()),
            ("time", entry.time.as_str()),
            ("date", entry.date.as_str()),
        ] {
            emit(writer, Event::Start(BytesStart::new(field)))?;
            emit(writer, Event::Text(BytesText::new(value)))?;
            emit(writer, Event::End(BytesEnd::new(field)))?;
        }
        return emit(writer, Event::End(BytesEnd::new(tag)));
    }

    start.push_attribute(("id", node.id()));
    if node.level() != Level::Subject {
        start.push_attribute(("typeID", node.type_id()));
        start.push_attribute(("uid", node.uid()));
    }
    start.push_attribute(("checked", flag(node.checked())));
    emit(writer, Event::Start(start))?;
    for &child in node.children() {
        write_node(writer, index, child)?;
    }
    emit(writer, Event::End(BytesEnd::new(tag)))
}

fn emit(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| IndexError::Io(std::io::Error::other(e.to_string())))
}
