// nodedb credential database firmware and supporting software libraries
//
// Copyright (C) 2024 Alekos Filini
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Higher level database operations shared by the CLI and the functional tests

use nodemgmt::flash::FlashDriver;
use nodemgmt::free::count_free_slots;
use nodemgmt::node::{
    CredChildNode, DataChildNode, NodeDate, ParentNode, DATA_PAYLOAD_LEN, DESCRIPTION_LEN,
    LOGIN_LEN, PASSWORD_LEN, SERVICE_LEN,
};
use nodemgmt::profile::{Profile, CATEGORY_NAME_LEN, NB_CATEGORY_NAMES, PROFILE_SIZE};
use nodemgmt::session::{ParentKind, Session};
use nodemgmt::{NodeAddress, NodeType, RamFlash, NB_CRED_ROOTS, NB_DATA_ROOTS, NB_FAVORITES};

use super::model::*;

/// Encode a string into a fixed-width field, always leaving room for the terminator
pub fn encode_str<const N: usize>(s: &str) -> [u16; N] {
    let mut out = [0u16; N];
    for (dst, c) in out.iter_mut().take(N - 1).zip(s.encode_utf16()) {
        *dst = c;
    }
    out
}

pub fn decode_str(chars: &[u16]) -> String {
    let end = chars.iter().position(|c| *c == 0).unwrap_or(chars.len());
    String::from_utf16_lossy(&chars[..end])
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Whether the profile of `uid` has been formatted.
///
/// Erased profiles read back as `0xFF`, so their roots point outside of the node area.
pub fn is_formatted<F: FlashDriver>(flash: &mut F, uid: u8) -> Result<bool, crate::Error> {
    let geometry = *flash.geometry();
    let roots = Profile::locate(&geometry, uid)?.roots(flash)?;

    Ok(roots
        .iter()
        .all(|root| root.is_null() || root.is_valid(&geometry)))
}

/// Whether the profile of `uid` is in the state a user deletion leaves behind: record zeroed and
/// category names erased.
///
/// Formatting with default preferences gives the same bytes, so such a user holds nothing.
pub fn is_blank<F: FlashDriver>(flash: &mut F, uid: u8) -> Result<bool, crate::Error> {
    let geometry = *flash.geometry();
    let profile = Profile::locate(&geometry, uid)?;

    let mut record = [0u8; PROFILE_SIZE];
    flash
        .read_block(profile.profile.page, profile.profile.offset, &mut record)
        .map_err(nodemgmt::Error::from)?;
    let mut names = [0u8; NB_CATEGORY_NAMES * CATEGORY_NAME_LEN * 2];
    flash
        .read_block(profile.category_names.page, profile.category_names.offset, &mut names)
        .map_err(nodemgmt::Error::from)?;

    Ok(record.iter().all(|b| *b == 0x00) && names.iter().all(|b| *b == 0xFF))
}

pub fn find_parent<F: FlashDriver>(
    session: &mut Session<F>,
    kind: ParentKind,
    type_id: usize,
    name: &str,
) -> Result<Option<NodeAddress>, crate::Error> {
    for addr in session.parents(kind, type_id)? {
        if decode_str(&session.read_parent_node(addr)?.service) == name {
            return Ok(Some(addr));
        }
    }

    Ok(None)
}

pub fn find_login<F: FlashDriver>(
    session: &mut Session<F>,
    parent: NodeAddress,
    login: &str,
) -> Result<Option<NodeAddress>, crate::Error> {
    for addr in session.children(parent)? {
        if decode_str(&session.read_cred_child_node_except_pwd(addr)?.login) == login {
            return Ok(Some(addr));
        }
    }

    Ok(None)
}

pub fn parent_names<F: FlashDriver>(
    session: &mut Session<F>,
    kind: ParentKind,
    type_id: usize,
) -> Result<Vec<String>, crate::Error> {
    session
        .parents(kind, type_id)?
        .into_iter()
        .map(|addr| Ok(decode_str(&session.read_parent_node(addr)?.service)))
        .collect()
}

pub fn login_names<F: FlashDriver>(
    session: &mut Session<F>,
    parent: NodeAddress,
) -> Result<Vec<String>, crate::Error> {
    session
        .children(parent)?
        .into_iter()
        .map(|addr| Ok(decode_str(&session.read_cred_child_node_except_pwd(addr)?.login)))
        .collect()
}

pub fn add_service<F: FlashDriver>(
    session: &mut Session<F>,
    kind: ParentKind,
    type_id: usize,
    service: &str,
) -> Result<NodeAddress, crate::Error> {
    let mut node = ParentNode::new(kind.node_type(), &encode_str::<SERVICE_LEN>(service));
    Ok(session.create_parent_node(kind, type_id, &mut node)?)
}

/// Add a login, creating its service first when needed
pub fn add_credential<F: FlashDriver>(
    session: &mut Session<F>,
    type_id: usize,
    service: &str,
    login: &str,
    description: &str,
    password: &[u8],
) -> Result<NodeAddress, crate::Error> {
    let parent = match find_parent(session, ParentKind::Credential, type_id, service)? {
        Some(parent) => parent,
        None => add_service(session, ParentKind::Credential, type_id, service)?,
    };

    let mut node = CredChildNode::new(&encode_str::<LOGIN_LEN>(login));
    node.description = encode_str::<DESCRIPTION_LEN>(description);
    let len = core::cmp::min(password.len(), PASSWORD_LEN);
    node.password[..len].copy_from_slice(&password[..len]);

    let child = session.create_child_node(parent, &mut node)?;
    session.db_changed(false)?;

    log::debug!("Added {}@{} at {}", login, service, child);
    Ok(child)
}

pub fn delete_login<F: FlashDriver>(
    session: &mut Session<F>,
    type_id: usize,
    service: &str,
    login: &str,
) -> Result<(), crate::Error> {
    let parent = find_parent(session, ParentKind::Credential, type_id, service)?
        .ok_or_else(|| format!("Service {} not found", service))?;
    let child = find_login(session, parent, login)?
        .ok_or_else(|| format!("Login {} not found in {}", login, service))?;

    session.delete_child(parent, child)?;
    session.db_changed(false)?;
    Ok(())
}

pub fn delete_service<F: FlashDriver>(
    session: &mut Session<F>,
    kind: ParentKind,
    type_id: usize,
    service: &str,
) -> Result<(), crate::Error> {
    let parent = find_parent(session, kind, type_id, service)?
        .ok_or_else(|| format!("Service {} not found", service))?;

    match kind {
        ParentKind::Credential => session.delete_parent(type_id, parent)?,
        ParentKind::Data => session.delete_data_parent(type_id, parent)?,
    }
    session.db_changed(kind == ParentKind::Data)?;
    Ok(())
}

/// Store `payload` under a new data parent, split across as many data children as needed.
///
/// When the flash fills up midway the partial entry is deleted again, so no slot is left behind.
pub fn store_data<F: FlashDriver>(
    session: &mut Session<F>,
    type_id: usize,
    name: &str,
    payload: &[u8],
) -> Result<NodeAddress, crate::Error> {
    let parent = add_service(session, ParentKind::Data, type_id, name)?;

    if let Err(e) = append_chunks(session, parent, payload) {
        log::warn!("Storing {} failed, removing the partial entry: {}", name, e);
        session.delete_data_parent(type_id, parent)?;
        return Err(e);
    }
    session.db_changed(true)?;

    log::debug!("Stored {} bytes as {} at {}", payload.len(), name, parent);
    Ok(parent)
}

// Every chunk is linked as soon as it is written, so a failure leaves a well formed chain
fn append_chunks<F: FlashDriver>(
    session: &mut Session<F>,
    parent: NodeAddress,
    payload: &[u8],
) -> Result<(), crate::Error> {
    let mut prev = NodeAddress::NULL;
    for chunk in payload.chunks(DATA_PAYLOAD_LEN) {
        let addr = session.store_data_node(&mut DataChildNode::new(chunk))?;
        if prev.is_null() {
            session.update_data_parent_ctr_and_first_child(parent, [0; 3], addr)?;
        } else {
            session.update_data_node_next(prev, addr)?;
        }
        prev = addr;
    }

    Ok(())
}

pub fn read_data<F: FlashDriver>(
    session: &mut Session<F>,
    parent: NodeAddress,
) -> Result<Vec<u8>, crate::Error> {
    let mut payload = Vec::new();
    let mut buf = [0u8; DATA_PAYLOAD_LEN];
    for addr in session.data_chain(parent)? {
        let (_, len) = session.read_data_node(addr, &mut buf)?;
        payload.extend_from_slice(&buf[..len]);
    }

    Ok(payload)
}

fn dump_user<F: FlashDriver>(session: &mut Session<F>) -> Result<UserDump, crate::Error> {
    let mut credentials = Vec::new();
    for type_id in 0..NB_CRED_ROOTS {
        for addr in session.parents(ParentKind::Credential, type_id)? {
            let parent = session.read_parent_node(addr)?;

            let mut logins = Vec::new();
            for child in session.children(addr)? {
                let node = session.read_cred_child_node(child)?;
                logins.push(LoginDump {
                    address: child.to_string(),
                    login: decode_str(&node.login),
                    description: decode_str(&node.description),
                    third_field: decode_str(&node.third_field),
                    category: node.flags().category,
                    created: NodeDate::unpack(node.date_created),
                    last_used: NodeDate::unpack(node.date_last_used),
                    password: base64::encode(&node.password[..]),
                });
            }

            let last_used = parent.last_child_used();
            credentials.push(ServiceDump {
                type_id,
                address: addr.to_string(),
                service: decode_str(&parent.service),
                last_used: (!last_used.is_null()).then(|| last_used.to_string()),
                logins,
            });
        }
    }

    let mut data = Vec::new();
    for type_id in 0..NB_DATA_ROOTS {
        for addr in session.parents(ParentKind::Data, type_id)? {
            let name = decode_str(&session.read_parent_node(addr)?.service);
            let (_, ctr, prev_gen) = session.data_parent_ctr_and_first_child(addr)?;
            let chunks = session.data_chain(addr)?.len();
            let payload = read_data(session, addr)?;

            data.push(DataDump {
                type_id,
                address: addr.to_string(),
                name,
                ctr: hex(&ctr),
                prev_gen,
                chunks,
                payload: base64::encode(&payload),
            });
        }
    }

    let favorites = session
        .favorites()?
        .iter()
        .enumerate()
        .filter(|(_, f)| f.is_set())
        .map(|(i, f)| FavoriteDump {
            category: i / NB_FAVORITES,
            slot: i % NB_FAVORITES,
            parent: f.parent.to_string(),
            child: f.child.to_string(),
        })
        .collect();

    Ok(UserDump {
        uid: session.user_id(),
        preferences: session.preferences(),
        cred_change_number: session.cred_change_number()?,
        data_change_number: session.data_change_number()?,
        ctr: hex(&session.ctr()?),
        category_names: session
            .category_names()?
            .iter()
            .map(|name| decode_str(name))
            .collect(),
        favorites,
        credentials,
        data,
    })
}

/// Dump every formatted user of the database, skipping blank profiles
pub fn dump_database(flash: &mut RamFlash) -> Result<DatabaseDump, crate::Error> {
    let geometry = *flash.geometry();

    let mut users = Vec::new();
    for uid in 0..geometry.max_users() {
        if !is_formatted(flash, uid)? || is_blank(flash, uid)? {
            continue;
        }

        let mut session = Session::open(&mut *flash, uid)?;
        users.push(dump_user(&mut session)?);
    }

    Ok(DatabaseDump {
        chip: geometry.chip.to_string(),
        page_count: geometry.page_count,
        bytes_per_page: geometry.bytes_per_page,
        free_slots: count_free_slots(flash)?,
        users,
    })
}

/// Number of nodes of each type in the whole node area
pub fn node_stats(flash: &mut RamFlash) -> Result<[usize; 4], crate::Error> {
    let geometry = *flash.geometry();
    let mut counts = [0usize; 4];
    for page in geometry.first_node_page()..geometry.page_count {
        for slot in 0..geometry.nodes_per_page() {
            let flags = nodemgmt::flash::read_flags(flash, NodeAddress::encode(page, slot as u8))
                .map_err(nodemgmt::Error::from)?;
            if flags.is_free() || !flags.is_integrity_ok() {
                continue;
            }

            let index = match flags.node_type() {
                NodeType::CredParent => 0,
                NodeType::CredChild => 1,
                NodeType::DataParent => 2,
                NodeType::DataChild => 3,
            };
            counts[index] += 1;
        }
    }

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodemgmt::profile::{format_profile, UserPreferences};
    use nodemgmt::Geometry;

    fn flash_with_user(uid: u8) -> RamFlash {
        let mut flash = RamFlash::new(Geometry::FLASH_1M);
        format_profile(&mut flash, uid, &UserPreferences::default()).unwrap();
        flash
    }

    #[test]
    fn test_strings() {
        let field = encode_str::<4>("abcdef");
        assert_eq!(field, [b'a' as u16, b'b' as u16, b'c' as u16, 0]);
        assert_eq!(decode_str(&field), "abc");
        assert_eq!(decode_str(&encode_str::<8>("ü")), "ü");
    }

    #[test]
    fn test_formatted_profiles() {
        let mut flash = flash_with_user(5);
        assert!(is_formatted(&mut flash, 5).unwrap());
        assert!(!is_formatted(&mut flash, 4).unwrap());
    }

    #[test]
    fn test_credentials_share_service() {
        let mut flash = flash_with_user(1);
        let mut session = Session::open(&mut flash, 1).unwrap();
        add_credential(&mut session, 0, "github.com", "bob", "", b"x").unwrap();
        add_credential(&mut session, 0, "github.com", "alice", "work", b"y").unwrap();

        assert_eq!(
            parent_names(&mut session, ParentKind::Credential, 0).unwrap(),
            vec!["github.com"]
        );
        let parent = find_parent(&mut session, ParentKind::Credential, 0, "github.com")
            .unwrap()
            .unwrap();
        assert_eq!(login_names(&mut session, parent).unwrap(), vec!["alice", "bob"]);
        assert_eq!(session.cred_change_number().unwrap(), 1);

        delete_login(&mut session, 0, "github.com", "alice").unwrap();
        assert_eq!(login_names(&mut session, parent).unwrap(), vec!["bob"]);
    }

    #[test]
    fn test_data_spanning_several_nodes() {
        let mut flash = flash_with_user(1);
        let payload: Vec<u8> = (0..1300u32).map(|i| (i % 251) as u8).collect();

        let mut session = Session::open(&mut flash, 1).unwrap();
        let parent = store_data(&mut session, 0, "blob.bin", &payload).unwrap();
        assert_eq!(session.data_chain(parent).unwrap().len(), 3);
        assert_eq!(read_data(&mut session, parent).unwrap(), payload);
        session.close();

        let dump = dump_database(&mut flash).unwrap();
        assert_eq!(dump.users.len(), 1);
        assert_eq!(dump.users[0].data[0].chunks, 3);
        assert_eq!(
            base64::decode(&dump.users[0].data[0].payload).unwrap(),
            payload
        );
        assert_eq!(node_stats(&mut flash).unwrap(), [0, 0, 1, 3]);
    }

    #[test]
    fn test_store_too_large_leaves_no_trace() {
        let mut flash = flash_with_user(1);
        let free = count_free_slots(&mut flash).unwrap();
        // More data children than there are free slot pairs
        let payload = vec![0x5Au8; 200 * DATA_PAYLOAD_LEN];

        let mut session = Session::open(&mut flash, 1).unwrap();
        let result = store_data(&mut session, 0, "huge.bin", &payload);
        assert!(matches!(
            result,
            Err(crate::Error::Database(nodemgmt::Error::NoSpace))
        ));
        assert!(parent_names(&mut session, ParentKind::Data, 0).unwrap().is_empty());

        // The space is still usable
        let parent = store_data(&mut session, 0, "small.bin", b"abc").unwrap();
        assert_eq!(read_data(&mut session, parent).unwrap(), b"abc");
        session.close();

        assert_eq!(count_free_slots(&mut flash).unwrap(), free - 3);
    }

    #[test]
    fn test_deleted_user_is_not_dumped() {
        let mut flash = flash_with_user(1);
        format_profile(&mut flash, 2, &UserPreferences::default()).unwrap();
        for uid in [1, 2] {
            let mut session = Session::open(&mut flash, uid).unwrap();
            add_credential(&mut session, 0, "site.org", "me", "", b"pw").unwrap();
        }

        let dump = dump_database(&mut flash).unwrap();
        assert_eq!(dump.users.iter().map(|u| u.uid).collect::<Vec<_>>(), vec![1, 2]);

        Session::open(&mut flash, 1)
            .unwrap()
            .delete_current_user()
            .unwrap();
        assert!(is_formatted(&mut flash, 1).unwrap());
        assert!(is_blank(&mut flash, 1).unwrap());
        assert!(!is_blank(&mut flash, 2).unwrap());

        let dump = dump_database(&mut flash).unwrap();
        assert_eq!(dump.users.iter().map(|u| u.uid).collect::<Vec<_>>(), vec![2]);
    }
}
