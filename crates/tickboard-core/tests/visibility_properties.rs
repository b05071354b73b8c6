use std::collections::HashSet;

use proptest::prelude::*;
use tickboard_core::model::{
    Board, BoardId, GroupAssignments, Principal, Role, Ticket, TicketId, UserId, UserRecord,
};
use tickboard_core::visibility::{Collections, derive_visible};

const GROUPS: [&str; 4] = ["BU", "OPS", "HR", "SMD"];
const USERS: [&str; 4] = ["u0", "u1", "u2", "u3"];

#[derive(Debug, Clone)]
struct World {
    boards: Vec<Board>,
    tickets: Vec<Ticket>,
    users: Vec<UserRecord>,
}

impl World {
    fn collections(&self) -> Collections<'_> {
        Collections {
            boards: &self.boards,
            tickets: &self.tickets,
            users: &self.users,
        }
    }
}

fn principal(id: &str, role: Option<Role>, groups: &[&str]) -> Principal {
    Principal {
        id: UserId::new(id),
        email: format!("{id}@x.com"),
        name: None,
        role,
        group_assignments: groups.iter().copied().collect::<GroupAssignments>(),
    }
}

fn arb_world() -> impl Strategy<Value = World> {
    let boards = prop::collection::vec((0..GROUPS.len(), 0..USERS.len()), 0..8);
    let tickets = prop::collection::vec((0usize..10, prop::option::of(0..USERS.len())), 0..24);
    let users = prop::collection::btree_set(0..USERS.len(), 0..=USERS.len());
    (boards, tickets, users).prop_map(|(boards, tickets, users)| {
        let boards: Vec<Board> = boards
            .into_iter()
            .enumerate()
            .map(|(i, (group, creator))| Board {
                id: BoardId::new(format!("b{i}")),
                name: GROUPS[group].to_string(),
                created_by: UserId::new(USERS[creator]),
                ..Board::default()
            })
            .collect();
        let tickets = tickets
            .into_iter()
            .enumerate()
            .map(|(i, (board, assignee))| Ticket {
                id: TicketId::new(format!("t{i}")),
                // Indices past the board list leave the ticket dangling.
                super_board_id: BoardId::new(format!("b{board}")),
                assignee_id: assignee.map(|a| UserId::new(USERS[a])),
                ..Ticket::default()
            })
            .collect();
        let users = users
            .into_iter()
            .map(|u| UserRecord {
                id: UserId::new(USERS[u]),
                name: USERS[u].to_uppercase(),
                ..UserRecord::default()
            })
            .collect();
        World {
            boards,
            tickets,
            users,
        }
    })
}

fn arb_principal() -> impl Strategy<Value = Principal> {
    (
        0..USERS.len(),
        prop::option::of(prop_oneof![Just(Role::Admin), Just(Role::User)]),
        prop::collection::vec(0..GROUPS.len(), 0..3),
    )
        .prop_map(|(user, role, groups)| {
            let tags: Vec<&str> = groups.into_iter().map(|g| GROUPS[g]).collect();
            principal(USERS[user], role, &tags)
        })
}

proptest! {
    #[test]
    fn view_is_a_subset_in_input_order(world in arb_world(), p in arb_principal()) {
        let view = derive_visible(Some(&p), world.collections(), false);
        let mut rest = world.boards.iter();
        for board in &view.boards {
            prop_assert!(rest.any(|b| b == board));
        }
        let mut rest = world.tickets.iter();
        for ticket in &view.tickets {
            prop_assert!(rest.any(|t| t == ticket));
        }
        let mut rest = world.users.iter();
        for user in &view.users {
            prop_assert!(rest.any(|u| u == user));
        }
    }

    #[test]
    fn ticket_visible_exactly_when_board_visible(world in arb_world(), p in arb_principal()) {
        prop_assume!(!p.sees_everything());
        let view = derive_visible(Some(&p), world.collections(), false);
        let visible: HashSet<&BoardId> = view.boards.iter().map(|b| &b.id).collect();
        for ticket in &world.tickets {
            let shown = view.tickets.iter().any(|t| t.id == ticket.id);
            prop_assert_eq!(shown, visible.contains(&ticket.super_board_id));
        }
    }

    #[test]
    fn principal_always_sees_own_profile(world in arb_world(), p in arb_principal()) {
        let view = derive_visible(Some(&p), world.collections(), false);
        if world.users.iter().any(|u| u.id == p.id) {
            prop_assert!(view.users.iter().any(|u| u.id == p.id));
        }
    }

    #[test]
    fn visible_users_are_self_or_assignees(world in arb_world(), p in arb_principal()) {
        prop_assume!(!p.sees_everything());
        let view = derive_visible(Some(&p), world.collections(), false);
        for user in &view.users {
            let assigned = view.tickets.iter().any(|t| t.is_assigned_to(&user.id));
            prop_assert!(user.id == p.id || assigned);
        }
    }

    #[test]
    fn admins_see_the_whole_snapshot(world in arb_world(), groups in prop::collection::vec(0..GROUPS.len(), 0..3)) {
        let tags: Vec<&str> = groups.into_iter().map(|g| GROUPS[g]).collect();
        let admin = principal("u0", Some(Role::Admin), &tags);
        let view = derive_visible(Some(&admin), world.collections(), false);
        prop_assert_eq!(&view.boards, &world.boards);
        prop_assert_eq!(&view.tickets, &world.tickets);
        prop_assert_eq!(&view.users, &world.users);
    }

    #[test]
    fn loading_or_signed_out_sees_nothing(world in arb_world(), p in arb_principal()) {
        prop_assert!(derive_visible(Some(&p), world.collections(), true).is_empty());
        prop_assert!(derive_visible(None, world.collections(), false).is_empty());
    }

    #[test]
    fn derivation_is_deterministic(world in arb_world(), p in arb_principal()) {
        let first = derive_visible(Some(&p), world.collections(), false);
        let second = derive_visible(Some(&p), world.collections(), false);
        prop_assert_eq!(first, second);
    }
}

#[test]
fn assignment_on_a_foreign_board_reveals_board_and_its_tickets() {
    let world = World {
        boards: vec![
            Board {
                id: BoardId::new("b-ops"),
                name: "OPS".into(),
                created_by: UserId::new("u9"),
                ..Board::default()
            },
            Board {
                id: BoardId::new("b-hr"),
                name: "HR".into(),
                created_by: UserId::new("u9"),
                ..Board::default()
            },
        ],
        tickets: vec![
            Ticket {
                id: TicketId::new("mine"),
                super_board_id: BoardId::new("b-ops"),
                assignee_id: Some(UserId::new("u1")),
                ..Ticket::default()
            },
            Ticket {
                id: TicketId::new("neighbour"),
                super_board_id: BoardId::new("b-ops"),
                assignee_id: Some(UserId::new("u2")),
                ..Ticket::default()
            },
            Ticket {
                id: TicketId::new("elsewhere"),
                super_board_id: BoardId::new("b-hr"),
                assignee_id: Some(UserId::new("u3")),
                ..Ticket::default()
            },
        ],
        users: ["u1", "u2", "u3"]
            .into_iter()
            .map(|id| UserRecord {
                id: UserId::new(id),
                ..UserRecord::default()
            })
            .collect(),
    };
    let p = principal("u1", Some(Role::User), &["BU"]);
    let view = derive_visible(Some(&p), world.collections(), false);

    let boards: Vec<&str> = view.boards.iter().map(|b| b.id.as_str()).collect();
    assert_eq!(boards, ["b-ops"]);
    let tickets: Vec<&str> = view.tickets.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(tickets, ["mine", "neighbour"]);
    let users: Vec<&str> = view.users.iter().map(|u| u.id.as_str()).collect();
    assert_eq!(users, ["u1", "u2"]);
}

#[test]
fn all_group_sees_everything_without_admin_role() {
    let world = World {
        boards: vec![Board {
            id: BoardId::new("b1"),
            name: "HR".into(),
            ..Board::default()
        }],
        tickets: vec![Ticket {
            id: TicketId::new("t1"),
            super_board_id: BoardId::new("b1"),
            ..Ticket::default()
        }],
        users: vec![UserRecord {
            id: UserId::new("someone"),
            ..UserRecord::default()
        }],
    };
    let p = principal("u1", None, &["ALL"]);
    let view = derive_visible(Some(&p), world.collections(), false);
    assert_eq!(view.boards.len(), 1);
    assert_eq!(view.tickets.len(), 1);
    assert_eq!(view.users.len(), 1);
    assert!(!p.is_admin());
}

#[test]
fn group_tag_selects_the_matching_board_only() {
    let boards = vec![
        Board {
            id: BoardId::new("b1"),
            name: "BU".into(),
            created_by: UserId::new("admin"),
            ..Board::default()
        },
        Board {
            id: BoardId::new("b2"),
            name: "SMD".into(),
            created_by: UserId::new("admin"),
            ..Board::default()
        },
    ];
    let mut user1 = principal("user1", Some(Role::User), &["BU"]);
    user1.email = "user1@x.com".into();
    let view = derive_visible(
        Some(&user1),
        Collections {
            boards: &boards,
            tickets: &[],
            users: &[],
        },
        false,
    );
    let ids: Vec<&str> = view.boards.iter().map(|b| b.id.as_str()).collect();
    assert_eq!(ids, ["b1"]);
    assert!(view.tickets.is_empty());
}
