use crate::error::Result;
use crate::layer::{Layer, Selector};
use crate::record::FileRecord;

use super::Depot;

const RULE: &str =
    "=======================================================================================";

pub(crate) fn header() -> String {
    format!(
        "{:<6} {:<36}  {:<19}  {}",
        "Serial", "UUID", "Installed", "Name"
    )
}

pub(crate) fn layer_row(layer: &Layer) -> String {
    format!(
        "{:<6} {:<36}  {:<19}  {}",
        layer.serial,
        layer.store_name(),
        layer.installed_local(),
        layer.name
    )
}

pub(crate) fn print_header_stderr() {
    eprintln!("{}", header());
    eprintln!(
        "====== ====================================  ===================  ================="
    );
}

impl Depot {
    /// print layers newest first; rollback twins stay hidden unless debug
    /// verbosity is on
    pub fn list(&self, selector: Option<&Selector>) -> Result<()> {
        let layers = match selector {
            Some(sel) => self.resolve(sel)?,
            None => self.catalog.layers(self.config.debug())?,
        };
        println!("{}", header());
        println!(
            "====== ====================================  ===================  ================="
        );
        for layer in &layers {
            println!("{}", layer_row(layer));
        }
        Ok(())
    }

    /// dump the file records of one layer
    pub fn files(&self, layer: &Layer) -> Result<()> {
        self.print_layer_heading(layer);
        for rec in self.catalog.files_of(layer.serial)? {
            self.print_file(&rec);
        }
        println!("{RULE}");
        println!();
        Ok(())
    }

    /// compare one layer's records against the live tree without mutating
    /// anything: M modified, R missing, blank identical
    pub fn verify(&self, layer: &Layer) -> Result<()> {
        self.print_layer_heading(layer);
        for rec in self.catalog.files_of(layer.serial)? {
            let state = match FileRecord::from_live(self.config.prefix(), &rec.path)? {
                None => 'R',
                Some(live) => {
                    if FileRecord::compare(&rec, &live).is_identical() {
                        ' '
                    } else {
                        'M'
                    }
                }
            };
            print!("{state} ");
            self.print_file(&rec);
        }
        println!("{RULE}");
        println!();
        Ok(())
    }

    /// every layer with every record, rollback twins included
    pub fn dump(&self) -> Result<()> {
        println!("{}", header());
        println!(
            "====== ====================================  ===================  ================="
        );
        for layer in self.catalog.layers(true)? {
            println!("{}", layer_row(&layer));
            println!("{RULE}");
            for rec in self.catalog.files_of(layer.serial)? {
                self.print_file_with_info(&rec);
            }
            println!("{RULE}");
            println!();
        }
        Ok(())
    }

    fn print_layer_heading(&self, layer: &Layer) {
        println!("{}", header());
        println!(
            "====== ====================================  ===================  ================="
        );
        println!("{}", layer_row(layer));
        println!("{RULE}");
    }

    fn print_file(&self, rec: &FileRecord) {
        if self.config.debug() {
            self.print_file_with_info(rec);
        } else {
            self.print_file_plain(rec);
        }
    }

    /// dump is intrinsically a debug listing, info bits included
    fn print_file_with_info(&self, rec: &FileRecord) {
        print!("{:04x} ", rec.info.bits());
        self.print_file_plain(rec);
    }

    fn print_file_plain(&self, rec: &FileRecord) {
        let digest = match rec.kind.digest() {
            Some(d) => d.to_hex(),
            None => " ".repeat(64),
        };
        println!(
            "{} {:>5} {:>5} {} {}",
            rec.mode_string(),
            rec.uid,
            rec.gid,
            digest,
            rec.path
        );
    }
}
