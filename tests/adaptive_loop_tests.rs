mod utils;

use smartmath::recommendation::models::Direction;
use smartmath::websockets::{MessageHandler, MessageType, WebSocketMessage};
use utils::{MessageAssertion, MessageContent, TestSetup, TestSetupBuilder, TEACHER};
use uuid::Uuid;

/// Starts a lobby holding the fixture students and returns the game id
async fn start_game(setup: &TestSetup) -> Uuid {
    let game = setup.lobby_with_students().await;
    setup.send_start(TEACHER, game.id).await;
    game.id
}

async fn next_batch(setup: &TestSetup, student: &str) -> MessageContent {
    MessageAssertion::for_connection(setup, student)
        .received_eventually(MessageType::ReceiveQuestions)
        .await
}

async fn round_finished(setup: &TestSetup, student: &str) -> MessageContent {
    MessageAssertion::for_connection(setup, student)
        .received_eventually(MessageType::RoundFinished)
        .await
}

#[tokio::test]
async fn test_improvement_labels_previous_round_up() {
    let setup = TestSetupBuilder::new()
        .with_students(vec!["alice"])
        .build()
        .await;
    let game_id = start_game(&setup).await;

    let first = next_batch(&setup, "alice").await;
    let first_round = first.round_id();
    setup
        .answer_round("alice", first_round, &first.question_ids(), 7)
        .await;
    setup.send_finish_round("alice", first_round).await;

    let finished = round_finished(&setup, "alice").await;
    assert!((finished.field_f64("accuracy") - 0.7).abs() < 1e-9);
    assert_eq!(finished.field_i64("xp_gained"), 70);
    assert_eq!(finished.field_str("recommendation"), "same");

    // Standings are pushed to the room after every finished round
    let standings = MessageAssertion::for_connection(&setup, TEACHER)
        .received_eventually(MessageType::UpdatePlayers)
        .await;
    assert_eq!(standings.payload["players_detailed"][0]["xp"], 70);

    setup.send_fetch_batch("alice", game_id).await;
    let second = next_batch(&setup, "alice").await;
    assert_eq!(second.field_i64("round_index"), 1);

    // 19 of 20
    let second_round = second.round_id();
    let questions: Vec<Uuid> = second
        .question_ids()
        .into_iter()
        .cycle()
        .take(20)
        .collect();
    setup
        .answer_round("alice", second_round, &questions, 19)
        .await;
    setup.send_finish_round("alice", second_round).await;
    let finished = round_finished(&setup, "alice").await;
    assert!((finished.field_f64("accuracy") - 0.95).abs() < 1e-9);

    {
        let tables = setup.db.tables().unwrap();
        let labeled: Vec<_> = tables
            .recommendations
            .values()
            .filter(|rec| rec.round_id == first_round)
            .collect();
        assert_eq!(labeled.len(), 1);
        assert_eq!(labeled[0].true_label, Some(Direction::Up));
        assert!(labeled[0].labeled_at.is_some());

        let latest = tables
            .recommendations
            .values()
            .find(|rec| rec.round_id == second_round)
            .unwrap();
        assert_eq!(latest.true_label, None);
        assert_eq!(latest.round_index, 1);

        let stats = &tables.stats[&setup.student("alice").id];
        assert_eq!(stats.xp, 165);
        assert_eq!(stats.total_attempts, 20);
    }

    let lessons = setup.oracle.lessons();
    assert_eq!(lessons.len(), 1);
    let (features, label, weight) = lessons[0];
    assert_eq!(label, Direction::Up);
    assert!((features.accuracy - 0.7).abs() < 1e-9);
    // Real sample weight scaled by the confidence of the original prediction
    assert!((weight - 4.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_concurrent_finishes_keep_students_apart() {
    let setup = TestSetupBuilder::new().with_two_students().build().await;
    start_game(&setup).await;

    let alice_batch = next_batch(&setup, "alice").await;
    let bob_batch = next_batch(&setup, "bob").await;
    setup
        .answer_round("alice", alice_batch.round_id(), &alice_batch.question_ids(), 10)
        .await;
    setup
        .answer_round("bob", bob_batch.round_id(), &bob_batch.question_ids(), 3)
        .await;

    let finish = |round_id: Uuid| {
        WebSocketMessage::new(
            MessageType::FinishRound,
            serde_json::json!({ "round_id": round_id }),
        )
        .to_json()
        .unwrap()
    };
    tokio::join!(
        setup
            .input_handler
            .handle_message("alice", finish(alice_batch.round_id())),
        setup
            .input_handler
            .handle_message("bob", finish(bob_batch.round_id())),
    );
    tokio::time::sleep(std::time::Duration::from_millis(25)).await;

    let alice = round_finished(&setup, "alice").await;
    let bob = round_finished(&setup, "bob").await;
    assert!((alice.field_f64("accuracy") - 1.0).abs() < 1e-9);
    assert!((bob.field_f64("accuracy") - 0.3).abs() < 1e-9);

    let tables = setup.db.tables().unwrap();
    assert_eq!(tables.stats[&setup.student("alice").id].xp, 100);
    assert_eq!(tables.stats[&setup.student("bob").id].xp, 30);
    assert_eq!(tables.recommendations.len(), 2);
}

#[tokio::test]
async fn test_finishing_twice_returns_the_same_result() {
    let setup = TestSetupBuilder::new()
        .with_students(vec!["alice"])
        .recommending(Direction::Up)
        .build()
        .await;
    start_game(&setup).await;

    let batch = next_batch(&setup, "alice").await;
    setup
        .answer_round("alice", batch.round_id(), &batch.question_ids(), 9)
        .await;

    setup.send_finish_round("alice", batch.round_id()).await;
    let first = round_finished(&setup, "alice").await;
    // The model changing its mind must not change a closed round
    setup.oracle.recommend(Direction::Down);
    setup.send_finish_round("alice", batch.round_id()).await;
    let second = round_finished(&setup, "alice").await;

    assert_eq!(first.field_i64("xp_gained"), 90);
    assert_eq!(second.field_i64("xp_gained"), 0);
    assert_eq!(second.field_str("recommendation"), "up");
    assert_eq!(first.field_i64("new_tier"), second.field_i64("new_tier"));

    let tables = setup.db.tables().unwrap();
    assert_eq!(tables.recommendations.len(), 1);
    assert_eq!(tables.stats[&setup.student("alice").id].xp, 90);
}

#[tokio::test]
async fn test_recommendation_moves_the_next_batch() {
    let setup = TestSetupBuilder::new()
        .with_students(vec!["alice"])
        .recommending(Direction::Up)
        .build()
        .await;
    let game_id = start_game(&setup).await;

    let batch = next_batch(&setup, "alice").await;
    setup
        .answer_round("alice", batch.round_id(), &batch.question_ids(), 10)
        .await;
    setup.send_finish_round("alice", batch.round_id()).await;

    let finished = round_finished(&setup, "alice").await;
    assert_eq!(finished.field_i64("prev_tier"), 1);
    assert_eq!(finished.field_i64("new_tier"), 2);
    assert_eq!(setup.student_row("alice").difficulty, 2);

    setup.send_fetch_batch("alice", game_id).await;
    let next = next_batch(&setup, "alice").await.with_question_count(10);
    let tier_two = next.difficulties().iter().filter(|d| **d == 2).count();
    assert_eq!(tier_two, 6);
}

#[tokio::test]
async fn test_tier_never_leaves_its_range() {
    let setup = TestSetupBuilder::new()
        .with_students(vec!["alice"])
        .recommending(Direction::Up)
        .build()
        .await;
    {
        let mut tables = setup.db.tables().unwrap();
        let alice = tables
            .users
            .get_mut(&setup.student("alice").id)
            .unwrap();
        alice.difficulty = 5;
    }
    start_game(&setup).await;

    let batch = next_batch(&setup, "alice").await;
    setup
        .answer_round("alice", batch.round_id(), &batch.question_ids(), 10)
        .await;
    setup.send_finish_round("alice", batch.round_id()).await;

    let finished = round_finished(&setup, "alice").await;
    assert_eq!(finished.field_i64("prev_tier"), 5);
    assert_eq!(finished.field_i64("new_tier"), 5);
    assert_eq!(setup.student_row("alice").difficulty, 5);
}

#[tokio::test]
async fn test_model_outage_leaves_round_open_for_retry() {
    let setup = TestSetupBuilder::new()
        .with_students(vec!["alice"])
        .build()
        .await;
    start_game(&setup).await;
    let batch = next_batch(&setup, "alice").await;
    setup
        .answer_round("alice", batch.round_id(), &batch.question_ids(), 5)
        .await;

    setup.oracle.set_available(false);
    setup.send_finish_round("alice", batch.round_id()).await;
    MessageAssertion::for_connection(&setup, "alice")
        .received_eventually(MessageType::FinishRoundError)
        .await
        .with_error_containing("model unavailable");
    {
        let tables = setup.db.tables().unwrap();
        assert!(tables.rounds[&batch.round_id()].end_ts.is_none());
        assert!(tables.recommendations.is_empty());
        assert!(!tables.stats.contains_key(&setup.student("alice").id));
    }

    setup.oracle.set_available(true);
    setup.send_finish_round("alice", batch.round_id()).await;
    let finished = round_finished(&setup, "alice").await;
    assert_eq!(finished.field_i64("xp_gained"), 50);
}

#[tokio::test]
async fn test_answers_are_checked_against_the_round() {
    let setup = TestSetupBuilder::new().with_two_students().build().await;
    let game_id = start_game(&setup).await;
    let alice_batch = next_batch(&setup, "alice").await;
    let bob_batch = next_batch(&setup, "bob").await;
    let question = alice_batch.question_ids()[0];
    setup.clear_messages().await;

    // Someone else's round
    setup
        .send_answer("bob", alice_batch.round_id(), question, true)
        .await;
    MessageAssertion::for_connection(&setup, "bob")
        .received_message_type(MessageType::AnswerError)
        .await;
    setup.send_finish_round("bob", alice_batch.round_id()).await;
    MessageAssertion::for_connection(&setup, "bob")
        .received_message_type(MessageType::FinishRoundError)
        .await;

    // A closed round takes no more answers
    setup
        .answer_round("alice", alice_batch.round_id(), &[question], 1)
        .await;
    setup.send_finish_round("alice", alice_batch.round_id()).await;
    round_finished(&setup, "alice").await;
    setup
        .send_answer("alice", alice_batch.round_id(), question, true)
        .await;
    MessageAssertion::for_connection(&setup, "alice")
        .received_eventually(MessageType::AnswerError)
        .await
        .with_error_containing("already finished");

    // Once the game is over only finishing is still possible
    setup.send_end_game(TEACHER, game_id).await;
    setup
        .send_answer("bob", bob_batch.round_id(), bob_batch.question_ids()[0], true)
        .await;
    MessageAssertion::for_connection(&setup, "bob")
        .received_eventually(MessageType::AnswerError)
        .await;
    setup.send_finish_round("bob", bob_batch.round_id()).await;
    let finished = round_finished(&setup, "bob").await;
    assert_eq!(finished.field_i64("xp_gained"), 0);
}

#[tokio::test]
async fn test_unknown_round_is_an_answer_error() {
    let setup = TestSetupBuilder::new()
        .with_students(vec!["alice"])
        .build()
        .await;
    start_game(&setup).await;
    setup.clear_messages().await;

    setup
        .send_answer("alice", Uuid::new_v4(), Uuid::new_v4(), true)
        .await;

    MessageAssertion::for_connection(&setup, "alice")
        .received_message_type(MessageType::AnswerError)
        .await
        .with_error_containing("Round not found");
}
