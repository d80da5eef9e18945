//! Conversion between libvirt XML and the typed clone model.
//!
//! Parsing keeps the whole document. Rendering writes the typed fields back
//! onto it positionally (the n-th `<disk>` gets the n-th attachment, and so
//! on), so elements the model does not know about pass through untouched.

use camino::Utf8PathBuf;
use uuid::Uuid;

use super::hypervisor::HypervisorError;
use super::model::{
    BackingStore, DiskSource, DomainConfig, FirmwarePathForm, FirmwareRef, GraphicsDevice,
    NetworkInterface, PortAllocation, StorageAttachment, Volume, VolumeFormat,
};
use crate::xml_utils::{parse_xml_dom, XmlNode};

const DOMAIN: &str = "domain XML";
const VOLUME: &str = "volume XML";

fn parse_document(what: &'static str, xml: &str) -> Result<XmlNode, HypervisorError> {
    parse_xml_dom(xml).map_err(|e| HypervisorError::malformed(what, format!("{e:#}")))
}

fn required_text<'a>(
    what: &'static str,
    node: &'a XmlNode,
    child: &str,
) -> Result<&'a str, HypervisorError> {
    node.child(child)
        .map(|n| n.text_content().trim())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HypervisorError::malformed(what, format!("missing <{child}>")))
}

/// Parse a persistent domain definition
pub fn parse_domain(xml: &str) -> Result<DomainConfig, HypervisorError> {
    let document = parse_document(DOMAIN, xml)?;
    if document.name != "domain" {
        return Err(HypervisorError::malformed(
            DOMAIN,
            format!("unexpected root element <{}>", document.name),
        ));
    }
    let name = required_text(DOMAIN, &document, "name")?.to_owned();
    let uuid = document
        .child("uuid")
        .map(|n| Uuid::parse_str(n.text_content().trim()))
        .transpose()
        .map_err(|e| HypervisorError::malformed(DOMAIN, format!("invalid uuid: {e}")))?;
    let firmware = document.find_path("os/nvram").and_then(parse_firmware);

    let (disks, interfaces, graphics): (Vec<_>, Vec<_>, Vec<_>) = match document.child("devices") {
        Some(devices) => (
            devices.children_named("disk").map(parse_disk).collect(),
            devices
                .children_named("interface")
                .map(parse_interface)
                .collect(),
            devices.children_named("graphics").map(parse_graphics).collect(),
        ),
        None => Default::default(),
    };

    Ok(DomainConfig {
        name,
        uuid,
        firmware,
        disks,
        interfaces,
        graphics,
        document,
    })
}

fn parse_firmware(nvram: &XmlNode) -> Option<FirmwareRef> {
    // Only file-backed stores can be duplicated as volumes
    if !matches!(nvram.attr("type"), None | Some("file")) {
        return None;
    }
    let text = nvram.text_content().trim();
    if !text.is_empty() {
        return Some(FirmwareRef {
            path: text.into(),
            form: FirmwarePathForm::Text,
        });
    }
    nvram
        .child("source")
        .and_then(|s| s.attr("file"))
        .map(|path| FirmwareRef {
            path: path.into(),
            form: FirmwarePathForm::SourceFile,
        })
}

fn parse_disk(node: &XmlNode) -> StorageAttachment {
    let kind = node.attr("type").unwrap_or("file");
    let file = node.child("source").and_then(|s| s.attr("file"));
    let source = match (kind, file) {
        ("file", Some(path)) => DiskSource::File(path.into()),
        _ => DiskSource::Other {
            kind: kind.to_owned(),
        },
    };
    StorageAttachment {
        target: node
            .child("target")
            .and_then(|t| t.attr("dev"))
            .map(ToOwned::to_owned),
        device: node.attr("device").unwrap_or("disk").to_owned(),
        source,
        format: node
            .child("driver")
            .and_then(|d| d.attr("type"))
            .map(VolumeFormat::from),
        read_only: node.child("readonly").is_some(),
    }
}

fn parse_interface(node: &XmlNode) -> NetworkInterface {
    NetworkInterface {
        kind: node.attr("type").unwrap_or_default().to_owned(),
        mac: node
            .child("mac")
            .and_then(|m| m.attr("address"))
            .map(ToOwned::to_owned),
        target: node
            .child("target")
            .and_then(|t| t.attr("dev"))
            .map(ToOwned::to_owned),
    }
}

fn parse_graphics(node: &XmlNode) -> GraphicsDevice {
    let kind = node.attr("type").unwrap_or_default().to_owned();
    let ports = GraphicsDevice::uses_ports(&kind).then(|| {
        let port = node.attr("port").and_then(|p| p.parse::<i32>().ok());
        if node.attr("autoport") == Some("yes") || port == Some(-1) {
            PortAllocation::Auto
        } else {
            PortAllocation::Fixed {
                port: port.and_then(|p| u16::try_from(p).ok()),
                tls_port: node.attr("tlsPort").and_then(|p| p.parse().ok()),
            }
        }
    });
    GraphicsDevice {
        kind,
        ports,
        websocket: node.attr("websocket").and_then(|p| p.parse().ok()),
    }
}

/// Serialize a domain definition, applying its typed fields to the document
pub fn render(config: &DomainConfig) -> Result<String, HypervisorError> {
    let mut doc = config.document.clone();
    doc.ensure_child("name").text = config.name.clone();
    match config.uuid {
        Some(uuid) => doc.ensure_child("uuid").text = uuid.to_string(),
        None => {
            doc.remove_children("uuid");
        }
    }
    if let Some(firmware) = &config.firmware {
        if let Some(nvram) = doc.find_path_mut("os/nvram") {
            apply_firmware(nvram, firmware);
        }
    }
    if let Some(devices) = doc.child_mut("devices") {
        for (node, disk) in devices.children_named_mut("disk").zip(&config.disks) {
            apply_disk(node, disk);
        }
        for (node, iface) in devices
            .children_named_mut("interface")
            .zip(&config.interfaces)
        {
            apply_interface(node, iface);
        }
        for (node, graphics) in devices.children_named_mut("graphics").zip(&config.graphics) {
            apply_graphics(node, graphics);
        }
    }
    doc.to_xml_string()
        .map_err(|e| HypervisorError::malformed(DOMAIN, format!("{e:#}")))
}

fn apply_firmware(nvram: &mut XmlNode, firmware: &FirmwareRef) {
    match firmware.form {
        FirmwarePathForm::Text => nvram.text = firmware.path.to_string(),
        FirmwarePathForm::SourceFile => nvram
            .ensure_child("source")
            .set_attr("file", firmware.path.as_str()),
    }
}

fn apply_disk(node: &mut XmlNode, disk: &StorageAttachment) {
    if let DiskSource::File(path) = &disk.source {
        let changed = {
            let source = node.ensure_child("source");
            let changed = source.attr("file") != Some(path.as_str());
            if changed {
                source.set_attr("file", path.as_str());
            }
            changed
        };
        // The recorded chain belonged to the old image
        if changed {
            node.remove_children("backingStore");
        }
    }
    if let Some(format) = &disk.format {
        if let Some(driver) = node.child_mut("driver") {
            driver.set_attr("type", format.as_str());
        }
    }
}

fn apply_interface(node: &mut XmlNode, iface: &NetworkInterface) {
    if let Some(mac) = &iface.mac {
        node.ensure_child("mac").set_attr("address", mac.as_str());
    }
    match &iface.target {
        Some(dev) => node.ensure_child("target").set_attr("dev", dev.as_str()),
        None => {
            node.remove_children("target");
        }
    }
}

fn apply_graphics(node: &mut XmlNode, graphics: &GraphicsDevice) {
    match graphics.ports {
        Some(PortAllocation::Auto) => {
            node.remove_attr("port");
            node.remove_attr("tlsPort");
            node.set_attr("autoport", "yes");
        }
        Some(PortAllocation::Fixed { port, tls_port }) => {
            if let Some(port) = port {
                node.set_attr("port", port.to_string());
            }
            if let Some(tls_port) = tls_port {
                node.set_attr("tlsPort", tls_port.to_string());
            }
        }
        None => {}
    }
    if let Some(websocket) = graphics.websocket {
        node.set_attr("websocket", websocket.to_string());
    }
}

/// Byte count of a `<capacity unit="...">N</capacity>` style element
pub(crate) fn parse_sized(node: &XmlNode) -> Option<u64> {
    let value: u64 = node.text_content().trim().parse().ok()?;
    let multiplier: u64 = match node.attr("unit").unwrap_or("bytes") {
        "b" | "B" | "bytes" => 1,
        "KB" => 1000,
        "k" | "K" | "KiB" => 1024,
        "MB" => 1000 * 1000,
        "M" | "MiB" => 1024 * 1024,
        "GB" => 1000 * 1000 * 1000,
        "G" | "GiB" => 1024 * 1024 * 1024,
        "TB" => 1000u64.pow(4),
        "T" | "TiB" => 1024u64.pow(4),
        _ => return None,
    };
    value.checked_mul(multiplier)
}

/// Parse the output of `virsh vol-dumpxml` for a volume of `pool`
pub fn parse_volume(xml: &str, pool: &str) -> Result<Volume, HypervisorError> {
    let doc = parse_document(VOLUME, xml)?;
    if doc.name != "volume" {
        return Err(HypervisorError::malformed(
            VOLUME,
            format!("unexpected root element <{}>", doc.name),
        ));
    }
    let name = required_text(VOLUME, &doc, "name")?.to_owned();
    let path: Utf8PathBuf = doc
        .find_path("target/path")
        .map(|n| n.text_content().trim())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HypervisorError::malformed(VOLUME, "missing <target><path>"))?
        .into();
    let format_of = |node: &XmlNode| {
        node.child("format")
            .and_then(|f| f.attr("type"))
            .map(VolumeFormat::from)
    };
    let backing_store = doc.child("backingStore").and_then(|b| {
        let path = b.child("path")?.text_content().trim();
        (!path.is_empty()).then(|| BackingStore {
            path: path.into(),
            format: format_of(b),
        })
    });

    Ok(Volume {
        pool: pool.to_owned(),
        name,
        key: doc.child("key").map(|k| k.text_content().trim().to_owned()),
        kind: doc.attr("type").map(ToOwned::to_owned),
        format: doc.child("target").and_then(format_of),
        path,
        capacity: doc.child("capacity").and_then(parse_sized),
        allocation: doc.child("allocation").and_then(parse_sized),
        physical: doc.child("physical").and_then(parse_sized),
        backing_store,
    })
}
