use rocket::http::{ContentType, Header, Status};
use rocket::local::blocking::Client;
use crate::attendance::{AttendanceCounts, AttendanceRecord, RejectReason, ScanAction, ScanOutcome, ScanRequest, StatusSummary};
use crate::auth::{AuthStatus, SignInOutcome, SignInRequest};
use crate::changes::{ChangesRecord, DataType};
use crate::event::{EventChange, EventRecord, PostedEvent, DEMO_API_TOKEN, DEMO_USER_EMAIL, DEMO_USER_PASSWORD};
use crate::student::{ImportSummary, StudentRecord};
use crate::util::test::zip_data;
use crate::API_TOKEN_HEADER;

fn create_test_server() -> Client {
    let client = Client::tracked(super::rocket()).unwrap();
    {
        let resp = client.get("/api/event/create-demo").dispatch();
        assert_eq!(resp.status(), Status::Ok);
    }
    client
}

fn sign_in(client: &Client) {
    let resp = client.post("/api/sign-in")
        .json(&SignInRequest { email: DEMO_USER_EMAIL.to_string(), password: DEMO_USER_PASSWORD.to_string() })
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let outcome = resp.into_json::<SignInOutcome>().unwrap();
    assert!(outcome.success, "{:?}", outcome.error);
}

fn scan(client: &Client, student_id: &str, action: Option<ScanAction>) -> ScanOutcome {
    let resp = client.post("/api/event/current/attendance/scan")
        .header(Header::new(API_TOKEN_HEADER, DEMO_API_TOKEN))
        .json(&ScanRequest { student_id: student_id.to_string(), action })
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    resp.into_json::<ScanOutcome>().unwrap()
}

fn event_attendance(client: &Client) -> Vec<AttendanceRecord> {
    let resp = client.get("/api/event/1/attendance").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    resp.into_json().unwrap()
}

#[test]
fn sign_in_and_session() {
    let client = create_test_server();

    let resp = client.post("/api/sign-in")
        .json(&SignInRequest { email: DEMO_USER_EMAIL.to_string(), password: "nope".to_string() })
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let outcome = resp.into_json::<SignInOutcome>().unwrap();
    assert!(!outcome.success);

    let resp = client.get("/api/session").dispatch();
    assert!(matches!(resp.into_json::<AuthStatus>().unwrap(), AuthStatus::Unauthenticated));

    sign_in(&client);
    let resp = client.get("/api/session").dispatch();
    match resp.into_json::<AuthStatus>().unwrap() {
        AuthStatus::Authenticated { user } => assert_eq!(user.email, DEMO_USER_EMAIL),
        other => panic!("expected authenticated session, got {other:?}"),
    }

    let resp = client.post("/api/sign-out").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get("/api/session").dispatch();
    assert!(matches!(resp.into_json::<AuthStatus>().unwrap(), AuthStatus::Unauthenticated));
}

#[test]
fn update_event_data() {
    let client = create_test_server();

    let resp = client.get("/api/event/current")
        .header(Header::new(API_TOKEN_HEADER, DEMO_API_TOKEN))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.content_type(), Some(ContentType::JSON));
    let event = resp.into_json::<EventRecord>().unwrap();
    assert_eq!(event.id, 1);
    assert_eq!(event.title, "Orientation Day");

    let change = EventChange {
        title: Some("Foo".to_string()),
        location: Some("Bar".to_string()),
        ..Default::default()
    };
    let resp = client.post("/api/event/current")
        .header(Header::new(API_TOKEN_HEADER, DEMO_API_TOKEN))
        .json(&change)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);

    let resp = client.get("/api/event/current")
        .header(Header::new(API_TOKEN_HEADER, DEMO_API_TOKEN))
        .dispatch();
    let event = resp.into_json::<EventRecord>().unwrap();
    assert_eq!(event.title, "Foo");
    assert_eq!(event.location, "Bar");
    assert_eq!(event.description, "Welcome assembly for incoming students");
}

#[test]
fn scan_state_machine() {
    let client = create_test_server();

    // unknown badge is rejected before the state machine runs
    let outcome = scan(&client, "X123", Some(ScanAction::Login));
    assert!(!outcome.success);
    assert_eq!(outcome.reason, Some(RejectReason::StudentNotFound));
    assert_eq!(outcome.error.as_deref(), Some("Student not found in database"));
    assert!(event_attendance(&client).is_empty());

    // first login opens a session
    let outcome = scan(&client, "S-1001", Some(ScanAction::Login));
    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.action.as_deref(), Some("check-in"));
    assert_eq!(outcome.previous_status.as_deref(), Some("checked-out"));
    assert_eq!(outcome.student.unwrap().first_name, "Ana");
    assert_eq!(event_attendance(&client).len(), 1);

    // duplicate login is rejected with zero writes
    let outcome = scan(&client, "S-1001", Some(ScanAction::Login));
    assert!(!outcome.success);
    assert_eq!(outcome.reason, Some(RejectReason::AlreadyLoggedIn));
    assert_eq!(event_attendance(&client).len(), 1);

    // logout closes the open session
    let outcome = scan(&client, "S-1001", Some(ScanAction::Logout));
    assert!(outcome.success);
    assert_eq!(outcome.action.as_deref(), Some("check-out"));
    assert_eq!(event_attendance(&client).len(), 1);
    assert!(event_attendance(&client)[0].check_out_time.is_some());

    // a second logout finds nothing open
    let outcome = scan(&client, "S-1001", Some(ScanAction::Logout));
    assert!(!outcome.success);
    assert_eq!(outcome.reason, Some(RejectReason::AlreadyLoggedOut));

    // logout with no history at all
    let outcome = scan(&client, "S-1002", Some(ScanAction::Logout));
    assert!(!outcome.success);
    assert_eq!(outcome.reason, Some(RejectReason::NoActiveSession));
    assert!(event_attendance(&client).iter().all(|r| r.student_id != "S-1002"));

    // the default action toggles, re-opening a fresh session
    let outcome = scan(&client, "S-1001", None);
    assert!(outcome.success);
    assert_eq!(outcome.action.as_deref(), Some("check-in"));
    let records = event_attendance(&client);
    assert_eq!(records.len(), 2);
    // newest first, only the newest is open
    assert!(records[0].check_out_time.is_none());
    assert!(records[1].check_out_time.is_some());

    let resp = client.get("/api/event/1/attendance/status/S-1001").dispatch();
    let status = resp.into_json::<StatusSummary>().unwrap();
    assert!(status.is_checked_in);
    assert_eq!(status.latest_record.unwrap().id, records[0].id);

    // toggling again closes it
    let outcome = scan(&client, "S-1001", None);
    assert!(outcome.success);
    assert_eq!(outcome.action.as_deref(), Some("check-out"));
    let resp = client.get("/api/event/1/attendance/status/S-1001").dispatch();
    let status = resp.into_json::<StatusSummary>().unwrap();
    assert!(!status.is_checked_in);
}

#[test]
fn never_seen_student_resolves_checked_out() {
    let client = create_test_server();
    let resp = client.get("/api/event/1/attendance/status/S-1003").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let status = resp.into_json::<StatusSummary>().unwrap();
    assert!(!status.is_checked_in);
    assert!(status.latest_record.is_none());
}

#[test]
fn attendance_counts() {
    let client = create_test_server();
    sign_in(&client);

    // one scan through the organizer route, one through the scanner route
    let resp = client.post("/api/event/1/attendance/scan")
        .json(&ScanRequest { student_id: "S-1001".to_string(), action: Some(ScanAction::Login) })
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert!(resp.into_json::<ScanOutcome>().unwrap().success);
    assert!(scan(&client, "S-1002", Some(ScanAction::Login)).success);
    assert!(scan(&client, "S-1001", Some(ScanAction::Logout)).success);

    let resp = client.get("/api/event/1/attendance/counts").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let counts = resp.into_json::<AttendanceCounts>().unwrap();
    assert_eq!(counts.login_count, 2);
    assert_eq!(counts.logout_count, 1);
}

#[test]
fn home_upcoming_events() {
    let client = create_test_server();
    sign_in(&client);
    for (title, date) in [
        ("E1", "2031-09-01"),
        ("E2", "2031-08-20"),
        ("E3", "2031-08-05"),
        ("E4", "2031-08-28"),
        ("E5", "2031-09-10"),
    ] {
        let posted = PostedEvent {
            title: title.to_string(),
            description: String::new(),
            location: String::new(),
            date: date.parse().unwrap(),
            start_time: "09:00".to_string(),
            end_time: "17:00".to_string(),
            is_featured: false,
        };
        let resp = client.post("/api/event").json(&posted).dispatch();
        assert_eq!(resp.status(), Status::Ok);
    }

    // the demo event is featured and therefore excluded
    let resp = client.get("/api/event/home-upcoming").dispatch();
    let events = resp.into_json::<Vec<EventRecord>>().unwrap();
    let titles: Vec<_> = events.iter().map(|e| e.title.as_str()).collect();
    assert_eq!(titles, vec!["E3", "E2", "E4"]);

    let resp = client.get("/api/event/home-upcoming?limit=5").dispatch();
    let events = resp.into_json::<Vec<EventRecord>>().unwrap();
    assert_eq!(events.len(), 5);

    let resp = client.get("/api/event/upcoming").dispatch();
    let events = resp.into_json::<Vec<EventRecord>>().unwrap();
    assert_eq!(events.len(), 6);

    // marking an event done removes it from the upcoming sets
    let done_id = events.iter().find(|e| e.title == "E3").unwrap().id;
    let resp = client.post(format!("/api/event/{done_id}/done")).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get("/api/event/home-upcoming").dispatch();
    let events = resp.into_json::<Vec<EventRecord>>().unwrap();
    let titles: Vec<_> = events.iter().map(|e| e.title.as_str()).collect();
    assert_eq!(titles, vec!["E2", "E4", "E1"]);
}

#[test]
fn featured_event() {
    let client = create_test_server();
    let resp = client.get("/api/event/featured").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let featured = resp.into_json::<Option<EventRecord>>().unwrap();
    assert_eq!(featured.unwrap().title, "Orientation Day");
}

#[test]
fn search_events() {
    let client = create_test_server();

    let resp = client.get("/api/event/search?q=gymnasium").dispatch();
    let events = resp.into_json::<Vec<EventRecord>>().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].title, "Orientation Day");

    let resp = client.get("/api/event/search?q=nothing-matches").dispatch();
    let events = resp.into_json::<Vec<EventRecord>>().unwrap();
    assert!(events.is_empty());
}

#[test]
fn import_students() {
    let client = create_test_server();
    sign_in(&client);

    let csv = "student_id,first_name,last_name,email,major,course,year,section\n\
               S-2001,Dana,Ocampo,dana.ocampo@example.edu,Nursing,BSN,1,C\n\
               S-2002,Eli,Santos,eli.santos@example.edu,Biology,BSBio,2,A\n";
    let compressed = zip_data(csv.as_bytes()).unwrap();
    let resp = client.post("/api/student/import")
        .header(ContentType::ZIP)
        .body(compressed)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let summary = resp.into_json::<ImportSummary>().unwrap();
    assert_eq!(summary.imported, 2);

    let resp = client.get("/api/student/S-2001").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let student = resp.into_json::<StudentRecord>().unwrap();
    assert_eq!(student.last_name, "Ocampo");

    // re-import refreshes instead of duplicating
    let resp = client.post("/api/student/import")
        .header(ContentType::CSV)
        .body(csv)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.into_json::<ImportSummary>().unwrap().imported, 2);

    let resp = client.get("/api/student/S-9999").dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}

#[test]
fn student_attendance_history() {
    let client = create_test_server();
    assert!(scan(&client, "S-1003", Some(ScanAction::Login)).success);
    assert!(scan(&client, "S-1003", Some(ScanAction::Logout)).success);

    let resp = client.get("/api/student/S-1003/attendance").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let records = resp.into_json::<Vec<AttendanceRecord>>().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event_id, 1);
    assert!(records[0].check_out_time.is_some());
    assert!(records[0].check_out_time.unwrap() >= records[0].check_in_time);
}

#[test]
fn change_journal() {
    let client = create_test_server();
    assert!(scan(&client, "S-1001", Some(ScanAction::Login)).success);

    let resp = client.get("/api/event/1/changes").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let records = resp.into_json::<Vec<ChangesRecord>>().unwrap();
    assert!(records.iter().any(|r| r.data_type == DataType::CheckIn && r.source == "scanner"));

    let resp = client.get("/api/event/1/changes?data_type=CheckOut").dispatch();
    let records = resp.into_json::<Vec<ChangesRecord>>().unwrap();
    assert!(records.is_empty());
}

#[test]
fn event_qr_code() {
    let client = create_test_server();
    sign_in(&client);
    let resp = client.get("/api/event/1/qr").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let data_uri = resp.into_json::<String>().unwrap();
    assert!(data_uri.starts_with("data:image/png;base64,"));
}

#[test]
fn delete_event_cascades() {
    let client = create_test_server();
    sign_in(&client);
    assert!(scan(&client, "S-1001", Some(ScanAction::Login)).success);

    let resp = client.delete("/api/event/1").dispatch();
    assert_eq!(resp.status(), Status::Ok);

    let resp = client.get("/api/event/1").dispatch();
    assert_eq!(resp.status(), Status::NotFound);
    let resp = client.get("/api/event/1/attendance").dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}
