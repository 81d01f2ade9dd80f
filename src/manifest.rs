//! The repo manifest XML format: an ordered list of projects with revisions,
//! remotes, defaults, and copyfile/linkfile overlay directives.
//!
//! Only the subset the filesystem consumes is modeled. `clone-url` and a hex
//! `revision` are normally filled in by dereferencing (see
//! [crate::populate::deref_manifest]) before a manifest is mounted.

use std::io::Cursor;

use xml::reader::{EventReader, XmlEvent as ReadEvent};
use xml::writer::{EmitterConfig, XmlEvent as WriteEvent};

use crate::Error;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Manifest {
    pub remotes: Vec<Remote>,
    pub default: DefaultSpec,
    pub projects: Vec<Project>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Remote {
    pub name: String,
    pub fetch: String,
    pub review: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DefaultSpec {
    pub revision: String,
    pub remote: String,
    pub sync_j: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Project {
    pub name: String,
    pub path: Option<String>,
    pub revision: String,
    pub clone_url: String,
    pub clone_depth: String,
    pub groups: Vec<String>,
    pub copyfile: Vec<Copyfile>,
    pub linkfile: Vec<Linkfile>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Copyfile {
    pub src: String,
    pub dest: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Linkfile {
    pub src: String,
    pub dest: String,
}

impl Project {
    /// The mount path of the project; defaults to its name.
    pub fn get_path(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }
}

impl Manifest {
    /// The revision for a project, falling back to the manifest default.
    pub fn project_revision<'a>(&'a self, p: &'a Project) -> &'a str {
        if p.revision.is_empty() {
            &self.default.revision
        } else {
            &p.revision
        }
    }

    /// Drops projects that are not checked out by default (any group named
    /// `notdefault`).
    pub fn filter(&mut self) {
        self.projects
            .retain(|p| !p.groups.iter().any(|g| g == "notdefault"));
    }

    /// Serializes the manifest back to XML.
    pub fn marshal_xml(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        let mut w = EmitterConfig::new()
            .perform_indent(true)
            .create_writer(&mut out);

        w.write(WriteEvent::start_element("manifest"))?;

        for r in &self.remotes {
            w.write(
                WriteEvent::start_element("remote")
                    .attr("name", &r.name)
                    .attr("fetch", &r.fetch)
                    .attr("review", &r.review),
            )?;
            w.write(WriteEvent::end_element())?;
        }

        w.write(
            WriteEvent::start_element("default")
                .attr("revision", &self.default.revision)
                .attr("remote", &self.default.remote)
                .attr("sync-j", &self.default.sync_j),
        )?;
        w.write(WriteEvent::end_element())?;

        for p in &self.projects {
            let groups = p.groups.join(",");
            let mut el = WriteEvent::start_element("project").attr("name", &p.name);
            if let Some(path) = &p.path {
                el = el.attr("path", path);
            }
            if !p.revision.is_empty() {
                el = el.attr("revision", &p.revision);
            }
            if !p.clone_url.is_empty() {
                el = el.attr("clone-url", &p.clone_url);
            }
            if !p.clone_depth.is_empty() {
                el = el.attr("clone-depth", &p.clone_depth);
            }
            if !groups.is_empty() {
                el = el.attr("groups", &groups);
            }
            w.write(el)?;

            for c in &p.copyfile {
                w.write(
                    WriteEvent::start_element("copyfile")
                        .attr("src", &c.src)
                        .attr("dest", &c.dest),
                )?;
                w.write(WriteEvent::end_element())?;
            }
            for l in &p.linkfile {
                w.write(
                    WriteEvent::start_element("linkfile")
                        .attr("src", &l.src)
                        .attr("dest", &l.dest),
                )?;
                w.write(WriteEvent::end_element())?;
            }

            w.write(WriteEvent::end_element())?;
        }

        w.write(WriteEvent::end_element())?;
        Ok(out)
    }
}

/// Parses manifest XML bytes.
pub fn parse(content: &[u8]) -> Result<Manifest, Error> {
    let mut mf = Manifest::default();
    let mut current_project: Option<Project> = None;
    let mut saw_manifest = false;

    for event in EventReader::new(Cursor::new(content)) {
        match event? {
            ReadEvent::StartElement {
                name, attributes, ..
            } => {
                let attr = |key: &str| -> String {
                    attributes
                        .iter()
                        .find(|a| a.name.local_name == key)
                        .map(|a| a.value.clone())
                        .unwrap_or_default()
                };

                match name.local_name.as_str() {
                    "manifest" => saw_manifest = true,
                    "remote" => mf.remotes.push(Remote {
                        name: attr("name"),
                        fetch: attr("fetch"),
                        review: attr("review"),
                    }),
                    "default" => {
                        mf.default = DefaultSpec {
                            revision: attr("revision"),
                            remote: attr("remote"),
                            sync_j: attr("sync-j"),
                        }
                    }
                    "project" => {
                        let path = attr("path");
                        let groups = attr("groups");
                        current_project = Some(Project {
                            name: attr("name"),
                            path: if path.is_empty() { None } else { Some(path) },
                            revision: attr("revision"),
                            clone_url: attr("clone-url"),
                            clone_depth: attr("clone-depth"),
                            groups: if groups.is_empty() {
                                Vec::new()
                            } else {
                                groups.split(',').map(|s| s.trim().to_string()).collect()
                            },
                            copyfile: Vec::new(),
                            linkfile: Vec::new(),
                        });
                    }
                    "copyfile" => {
                        let p = current_project
                            .as_mut()
                            .ok_or_else(|| Error::Parse("copyfile outside project".to_string()))?;
                        p.copyfile.push(Copyfile {
                            src: attr("src"),
                            dest: attr("dest"),
                        });
                    }
                    "linkfile" => {
                        let p = current_project
                            .as_mut()
                            .ok_or_else(|| Error::Parse("linkfile outside project".to_string()))?;
                        p.linkfile.push(Linkfile {
                            src: attr("src"),
                            dest: attr("dest"),
                        });
                    }
                    _ => {}
                }
            }
            ReadEvent::EndElement { name } => {
                if name.local_name == "project" {
                    if let Some(p) = current_project.take() {
                        mf.projects.push(p);
                    }
                }
            }
            _ => {}
        }
    }

    if !saw_manifest {
        return Err(Error::Parse("no <manifest> element".to_string()));
    }
    Ok(mf)
}

/// Parses the manifest in a file.
pub fn parse_file(path: &std::path::Path) -> Result<Manifest, Error> {
    let content = std::fs::read(path)?;
    parse(&content)
}
