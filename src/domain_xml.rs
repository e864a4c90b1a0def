use std::path::Path;

use crate::mounts::MountSpec;
use crate::util::xml_escape;

/// Everything needed to define a domain.
#[derive(Debug, Clone)]
pub struct DomainSpec<'a> {
    pub name: &'a str,
    pub cpus: u32,
    pub memory_mib: u64,
    pub disk: &'a Path,
    pub network: &'a str,
    pub domain_type: &'a str,
    pub machine: &'a str,
    /// Installer ISO attached as a CD-ROM and booted first.
    pub install_iso: Option<&'a Path>,
}

/// Generate libvirt domain XML.
///
/// Memory is backed by shared memfd pages, which virtiofs requires; filesystem
/// shares themselves are attached separately once the domain is running.
pub fn generate_domain_xml(spec: &DomainSpec<'_>) -> String {
    let name = xml_escape(spec.name);
    let memory_kib = spec.memory_mib * 1024;
    let cpus = spec.cpus;
    let domain_type = xml_escape(spec.domain_type);
    let machine = xml_escape(spec.machine);
    let disk = xml_escape(&spec.disk.to_string_lossy());
    let network = xml_escape(spec.network);

    let (boot, cdrom) = match spec.install_iso {
        Some(iso) => (
            "    <boot dev='cdrom'/>\n    <boot dev='hd'/>\n",
            format!(
                r#"    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
"#,
                xml_escape(&iso.to_string_lossy())
            ),
        ),
        None => ("    <boot dev='hd'/>\n", String::new()),
    };

    format!(
        r#"<domain type='{domain_type}'>
  <name>{name}</name>
  <memory unit='KiB'>{memory_kib}</memory>
  <currentMemory unit='KiB'>{memory_kib}</currentMemory>
  <vcpu>{cpus}</vcpu>
  <memoryBacking>
    <source type='memfd'/>
    <access mode='shared'/>
  </memoryBacking>
  <os>
    <type arch='x86_64' machine='{machine}'>hvm</type>
{boot}  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
{cdrom}    <interface type='network'>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
    <graphics type='spice' autoport='yes'/>
    <video>
      <model type='virtio'/>
    </video>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
  </devices>
</domain>
"#
    )
}

/// Generate a virtiofs `<filesystem>` device descriptor for one mount.
pub fn filesystem_xml(mount: &MountSpec) -> String {
    let source = xml_escape(&mount.source.to_string_lossy());
    let tag = xml_escape(&mount.tag);
    let readonly = if mount.readonly { "  <readonly/>\n" } else { "" };
    format!(
        r#"<filesystem type='mount' accessmode='passthrough'>
  <driver type='virtiofs'/>
  <source dir='{source}'/>
  <target dir='{tag}'/>
{readonly}</filesystem>
"#
    )
}

/// Whether a domain XML document already has a filesystem share with `tag`.
pub fn has_filesystem_tag(domain_xml: &str, tag: &str) -> bool {
    let tag = xml_escape(tag);
    let single = format!("<target dir='{tag}'");
    let double = format!("<target dir=\"{tag}\"");
    let mut rest = domain_xml;
    while let Some(start) = rest.find("<filesystem") {
        let block = &rest[start..];
        let end = block.find("</filesystem>").unwrap_or(block.len());
        let block = &block[..end];
        if block.contains(&single) || block.contains(&double) {
            return true;
        }
        rest = &rest[start + end..];
    }
    false
}
