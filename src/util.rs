//! Plist helpers shared by the services

use plist::Value;

/// Serializes a dictionary as an XML plist
pub(crate) fn plist_to_xml_bytes(p: &plist::Dictionary) -> Result<Vec<u8>, plist::Error> {
    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, p)?;
    Ok(buf)
}

/// Renders a plist value as an indented, human readable tree for logs
pub fn pretty_print_plist(p: &Value) -> String {
    print_plist(p, 0)
}

/// Renders a plist dictionary as an indented, human readable tree for logs
pub fn pretty_print_dictionary(dict: &plist::Dictionary) -> String {
    print_dict(dict, 0)
}

fn print_dict(dict: &plist::Dictionary, indentation: usize) -> String {
    let indent = "  ".repeat(indentation);
    let items: Vec<String> = dict
        .iter()
        .map(|(k, v)| format!("{indent}  {k}: {}", print_plist(v, indentation + 1)))
        .collect();
    format!("{{\n{}\n{indent}}}", items.join(",\n"))
}

fn print_plist(p: &Value, indentation: usize) -> String {
    let indent = "  ".repeat(indentation);
    match p {
        Value::Array(array) => {
            if array.is_empty() {
                return "[]".to_string();
            }
            let items: Vec<String> = array
                .iter()
                .map(|v| format!("{indent}  {}", print_plist(v, indentation + 1)))
                .collect();
            format!("[\n{}\n{indent}]", items.join(",\n"))
        }
        Value::Dictionary(dict) => print_dict(dict, indentation),
        Value::Boolean(b) => b.to_string(),
        Value::Data(data) => {
            // blobs can be megabytes, only show the size
            format!("Data({} bytes)", data.len())
        }
        Value::Date(date) => format!("Date({})", date.to_xml_format()),
        Value::Real(r) => r.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::String(s) => format!("\"{s}\""),
        Value::Uid(u) => format!("Uid({})", u.get()),
        _ => "Unknown".to_string(),
    }
}
