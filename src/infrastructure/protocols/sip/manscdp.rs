//! MANSCDP XML bodies carried in MESSAGE requests
//!
//! Devices send `Notify` (keepalive, alarms) and `Response` (catalog, record
//! info) documents. Bodies are read as UTF-8 first and re-read as GBK when
//! that fails, since many devices ignore their own `encoding` declaration.

use crate::domain::{CatalogEntry, GatewayError, Result};
use encoding_rs::GBK;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;

pub const CONTENT_TYPE: &str = "Application/MANSCDP+xml";

/// Decoded MANSCDP document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManscdpMessage {
    Notify { cmd_type: String, device_id: String },
    Response(ManscdpResponse),
    Query { cmd_type: String, device_id: String },
    /// Unrecognized root element
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManscdpResponse {
    /// One catalog fragment; large catalogs arrive as several messages
    /// sharing `sn`, together carrying `sum_num` items.
    Catalog {
        device_id: String,
        sn: u32,
        sum_num: u32,
        items: Vec<CatalogEntry>,
    },
    RecordInfo { device_id: String, sum_num: u32 },
    Other { cmd_type: String, device_id: String },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Body {
    cmd_type: String,
    #[serde(rename = "DeviceID")]
    device_id: String,
    #[serde(rename = "SN")]
    sn: Option<String>,
    sum_num: Option<String>,
    device_list: Option<ItemList<Item>>,
}

#[derive(Debug, Deserialize)]
struct ItemList<T> {
    #[serde(rename = "Item", default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Item {
    #[serde(rename = "DeviceID")]
    device_id: String,
    #[serde(rename = "ParentID")]
    parent_id: String,
    name: String,
    manufacturer: String,
    model: String,
    owner: String,
    civil_code: String,
    address: String,
    parental: String,
    safety_way: String,
    register_way: String,
    secrecy: String,
    status: String,
}

fn flag(value: &str) -> u8 {
    value.trim().parse().unwrap_or(0)
}

impl From<Item> for CatalogEntry {
    fn from(item: Item) -> Self {
        CatalogEntry {
            parental: flag(&item.parental),
            safety_way: flag(&item.safety_way),
            register_way: flag(&item.register_way),
            secrecy: flag(&item.secrecy),
            channel_id: item.device_id,
            parent_id: item.parent_id,
            name: item.name,
            manufacturer: item.manufacturer,
            model: item.model,
            owner: item.owner,
            civil_code: item.civil_code,
            address: item.address,
            status: item.status,
        }
    }
}

fn root_element(xml: &str) -> std::result::Result<String, String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Ok(String::from_utf8_lossy(e.name().as_ref()).into_owned())
            }
            Ok(Event::Eof) => return Err("document has no root element".to_string()),
            Ok(_) => continue,
            Err(e) => return Err(e.to_string()),
        }
    }
}

fn parse(xml: &str) -> std::result::Result<ManscdpMessage, String> {
    let root = root_element(xml)?;
    let body: Body = quick_xml::de::from_str(xml).map_err(|e| e.to_string())?;
    let number = |value: Option<&str>| -> u32 {
        value.and_then(|n| n.trim().parse().ok()).unwrap_or(0)
    };
    let sum_num = number(body.sum_num.as_deref());

    let message = match root.as_str() {
        "Notify" => ManscdpMessage::Notify {
            cmd_type: body.cmd_type,
            device_id: body.device_id,
        },
        "Query" => ManscdpMessage::Query {
            cmd_type: body.cmd_type,
            device_id: body.device_id,
        },
        "Response" => ManscdpMessage::Response(match body.cmd_type.as_str() {
            "Catalog" => ManscdpResponse::Catalog {
                device_id: body.device_id,
                sn: number(body.sn.as_deref()),
                sum_num,
                items: body
                    .device_list
                    .map(|list| list.items.into_iter().map(CatalogEntry::from).collect())
                    .unwrap_or_default(),
            },
            "RecordInfo" => ManscdpResponse::RecordInfo {
                device_id: body.device_id,
                sum_num,
            },
            _ => ManscdpResponse::Other {
                cmd_type: body.cmd_type,
                device_id: body.device_id,
            },
        }),
        _ => ManscdpMessage::Other(root),
    };
    Ok(message)
}

/// Decode a MESSAGE body, falling back to GBK when the UTF-8 read fails.
pub fn decode(body: &[u8]) -> Result<ManscdpMessage> {
    let utf8_error = match std::str::from_utf8(body) {
        Ok(text) => match parse(text) {
            Ok(message) => return Ok(message),
            Err(e) => e,
        },
        Err(e) => e.to_string(),
    };

    let text = GBK
        .decode_without_bom_handling_and_without_replacement(body)
        .ok_or_else(|| GatewayError::Decode(format!("utf-8: {}; gbk: invalid byte sequence", utf8_error)))?;
    parse(&text).map_err(|e| GatewayError::Decode(format!("utf-8: {}; gbk: {}", utf8_error, e)))
}

/// Catalog query sent to a device; `sn` is the request's CSeq.
pub fn catalog_query(sn: u32, device_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n\
         <Query>\r\n\
         <CmdType>Catalog</CmdType>\r\n\
         <SN>{}</SN>\r\n\
         <DeviceID>{}</DeviceID>\r\n\
         </Query>\r\n",
        sn, device_id
    )
}
